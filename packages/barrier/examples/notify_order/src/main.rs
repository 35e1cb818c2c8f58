#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Timer policy example.
//!
//! Spawns worker threads that block on the shared cell and, after a fixed delay, wakes at most
//! `--notify-count` of them. Workers that only start waiting after the timer fired are never
//! woken and give up once `--wait-timeout-ms` passes.
//!
//! ```bash
//! RUST_LOG=info cargo run --package barrier_notify_order -- --notify-count 3
//! ```

use std::time::Duration;

use clap::Parser;
use readiness_barrier::{
    BarrierConfig, Context, NotifyCount, Policy, ThreadRuntime, create_barrier, worker::Staggered,
};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Barrier(#[from] readiness_barrier::Error),
    #[error(transparent)]
    Config(#[from] readiness_barrier::ConfigError),
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Timer delay before the notify.
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,

    /// Number of waiters to wake, or `all`.
    #[arg(short, long, default_value = "3")]
    notify_count: NotifyCount,

    /// Per-worker delay before it starts waiting. Missing entries start right away.
    #[arg(long, value_delimiter = ',', default_value = "10,20,15,1000")]
    stagger_ms: Vec<u64>,

    #[arg(long, default_value_t = 2000)]
    wait_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let args = Args::parse();
    log::debug!("args={args:?}");

    let context = Context::from_env()?;
    let config = BarrierConfig::new(
        args.workers,
        Policy::Timer {
            delay: Duration::from_millis(args.delay_ms),
            notify_count: args.notify_count,
        },
    )
    .with_wait_timeout(Some(Duration::from_millis(args.wait_timeout_ms)));

    let barrier = create_barrier(
        &context,
        config,
        Staggered::from_millis(args.stagger_ms),
        &ThreadRuntime,
    )?;

    if let Some(release) = barrier.released().await {
        println!(
            "notified after {}ms, woke {} worker(s)",
            release.elapsed.as_millis(),
            release.woken
        );
    }

    let outcome = barrier.join().await?;
    for worker in &outcome.workers {
        println!(
            "worker {}: {} (released={})",
            worker.identity,
            worker
                .wait
                .map_or_else(|| "did not wait".to_string(), |wait| wait.to_string()),
            worker.released
        );
    }

    Ok(())
}
