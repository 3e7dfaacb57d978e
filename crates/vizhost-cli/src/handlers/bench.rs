//! Bench command handler.
//!
//! Runs the same command stream on several leased instances at once and
//! reports latency percentiles. Sessions beyond `max_instances` queue on
//! the pool, which shows up as wall time rather than per-command latency.

use crate::commands::BenchArgs;
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use crate::handlers::{open_pool, print_json, runtime};
use futures::future::join_all;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vizhost::InstancePool;

/// Latency summary for one bench run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    /// Parallel sessions requested
    pub sessions: usize,
    /// Sessions that obtained an instance
    pub sessions_started: usize,
    /// Commands issued
    pub commands: usize,
    /// Commands rejected or failed
    pub failures: usize,
    /// Engines launched, warm-up included
    pub launches: usize,
    /// Wall time for the whole run
    pub elapsed_ms: f64,
    /// Median command latency
    pub p50_ms: f64,
    /// 95th percentile command latency
    pub p95_ms: f64,
    /// Slowest command
    pub max_ms: f64,
    /// Commands per second of wall time
    pub throughput: f64,
}

#[derive(Debug, Default)]
struct SessionRun {
    latencies: Vec<Duration>,
    failures: usize,
}

/// Nearest-rank percentile of sorted samples, in milliseconds
#[must_use]
pub fn percentile_ms(sorted: &[Duration], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_secs_f64() * 1000.0
}

async fn run_session(pool: &InstancePool, template: &str, iterations: usize) -> CliResult<SessionRun> {
    let lease = pool.acquire().await?;
    let mut run = SessionRun::default();
    for i in 0..iterations {
        let command = template.replace("{i}", &i.to_string());
        let started = Instant::now();
        if let Err(e) = lease.eval_command(&command).await {
            warn!(instance = %lease.id(), error = %e, "bench command failed");
            run.failures += 1;
        }
        run.latencies.push(started.elapsed());
    }
    pool.release(lease).await;
    Ok(run)
}

/// Run the benchmark on `pool`
///
/// # Errors
///
/// Returns `InvalidArgument` for zero sessions or iterations
pub async fn run_bench(pool: &InstancePool, args: &BenchArgs) -> CliResult<BenchReport> {
    if args.sessions == 0 || args.iterations == 0 {
        return Err(CliError::invalid_argument(
            "sessions and iterations must be at least 1",
        ));
    }

    let warmed = pool.warm_up(args.sessions).await;
    info!(warmed, sessions = args.sessions, "bench starting");

    let started = Instant::now();
    let runs = join_all((0..args.sessions).map(|_| run_session(pool, &args.command, args.iterations))).await;
    let elapsed = started.elapsed();

    let mut latencies = Vec::new();
    let mut failures = 0;
    let mut sessions_started = 0;
    for run in runs {
        match run {
            Ok(run) => {
                sessions_started += 1;
                failures += run.failures;
                latencies.extend(run.latencies);
            }
            Err(e) => warn!(error = %e, "bench session could not start"),
        }
    }
    latencies.sort_unstable();

    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    Ok(BenchReport {
        sessions: args.sessions,
        sessions_started,
        commands: latencies.len(),
        failures,
        launches: pool.stats().launches as usize,
        elapsed_ms,
        p50_ms: percentile_ms(&latencies, 50.0),
        p95_ms: percentile_ms(&latencies, 95.0),
        max_ms: latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
        throughput: if elapsed_ms > 0.0 {
            latencies.len() as f64 / (elapsed_ms / 1000.0)
        } else {
            0.0
        },
    })
}

/// Execute the bench command
pub fn execute(config: &CliConfig, args: &BenchArgs) -> CliResult<()> {
    let pool = open_pool(config)?;
    let report = runtime()?.block_on(async {
        let report = run_bench(&pool, args).await;
        pool.cleanup().await;
        report
    })?;
    print_json(&report)
}
