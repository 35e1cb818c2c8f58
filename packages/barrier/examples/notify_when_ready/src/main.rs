#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Quorum policy example.
//!
//! Spawns worker threads that each do some work, report ready and block on the shared cell. The
//! owner logs every report as `Ready; id=…, count=…, time=…ms` and wakes all workers once the
//! last one has reported.
//!
//! The barrier is configured from the `READINESS_*` environment variables, see
//! [`readiness_barrier::config`], except for `READINESS_POLICY`: the policy is always quorum and
//! any other value is overridden with a warning. Command line arguments override the rest.
//!
//! ```bash
//! RUST_LOG=info cargo run --package barrier_notify_when_ready -- --work-ms 100,150,90,200
//! ```

use clap::Parser;
use readiness_barrier::{
    BarrierConfig, Context, DuplicateReportPolicy, Policy, ThreadRuntime, create_barrier,
    worker::Staggered,
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
    #[arg(short, long)]
    workers: Option<usize>,

    /// How long each worker works before reporting ready.
    #[arg(long, value_delimiter = ',', default_value = "100,150,90,200")]
    work_ms: Vec<u64>,

    #[arg(long)]
    duplicates: Option<DuplicateReportPolicy>,
}

fn force_quorum(mut config: BarrierConfig) -> BarrierConfig {
    if config.policy != Policy::Quorum {
        log::warn!(
            "Ignoring READINESS_POLICY={}, this example always uses the quorum policy",
            config.policy.name()
        );
        config.policy = Policy::Quorum;
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let args = Args::parse();
    log::debug!("args={args:?}");

    let context = Context::from_env()?.with_name("notify-when-ready");
    let mut config = force_quorum(BarrierConfig::from_env()?);
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(duplicates) = args.duplicates {
        config.duplicates = duplicates;
    }

    let barrier = create_barrier(
        &context,
        config,
        Staggered::from_millis(args.work_ms),
        &ThreadRuntime,
    )?;

    let outcome = barrier.join().await?;

    if let Some(release) = outcome.report.release {
        println!(
            "released after {}ms, woke {} worker(s)",
            release.elapsed.as_millis(),
            release.woken
        );
    }
    for violation in &outcome.report.violations {
        println!("protocol violation: {violation}");
    }

    Ok(())
}
