use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use conncache::{CacheConfig, ConnectionCache};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{SimulatedConfig, SimulatedDriver, Workload, WorkloadsConfig};

/// Outcome of running a single workload.
struct WorkloadStats {
    concurrency: usize,
    durations: DDSketch,
    errors: usize,
}

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = ConnectionCache::new(cache_config, SimulatedDriver);

    // warmup: open the first connection of each workload
    {
        let start = Instant::now();

        let futures = workloads.workloads.iter().enumerate().map(|(i, workload)| {
            let cache = cache.clone();
            let config = SimulatedConfig::new(i, 0, workload.open_latency);
            tokio::spawn(async move { cache.acquire(config).await.map(drop) })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let deadline = tokio::time::Instant::now() + duration;
        let cache = cache.clone();
        tasks.push(tokio::spawn(run_workload(cache, i, workload, deadline)));
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let start = Instant::now();
    cache.close().await?;
    println!("Shutdown: {:?}", start.elapsed());
    println!();

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadStats {
            concurrency,
            durations,
            errors,
        } = task?;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
        );
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}

async fn run_workload(
    cache: ConnectionCache<SimulatedDriver>,
    index: usize,
    workload: Workload,
    deadline: tokio::time::Instant,
) -> WorkloadStats {
    let concurrency = workload.concurrency;
    let durations = Arc::new(Mutex::new(DDSketch::default()));
    let errors = Arc::new(AtomicUsize::new(0));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut next_key = 0;

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let config = SimulatedConfig::new(index, next_key, workload.open_latency);
                next_key = (next_key + 1) % workload.keys.max(1);

                let cache = cache.clone();
                let durations = Arc::clone(&durations);
                let errors = Arc::clone(&errors);
                let hold = workload.hold;
                let task_start = Instant::now();

                let future = async move {
                    match cache.acquire(config).await {
                        Ok(lease) => {
                            tokio::time::sleep(hold).await;
                            lease.release();
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "failed to acquire connection");
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());
                    drop(permit);
                };
                tokio::spawn(future.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let durations = std::mem::take(&mut *durations.lock().unwrap());
    WorkloadStats {
        concurrency,
        durations,
        errors: errors.load(Ordering::Relaxed),
    }
}
