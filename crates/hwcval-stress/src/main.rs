#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hwcval_stress::{run_scenario, ScenarioConfig};
use hwcval_sync::{ReleaseMode, SyncConfig};
use tracing_subscriber::EnvFilter;

/// Drive a producer/consumer release-fence scenario through the synthetic fence engine.
///
/// Sync settings start from the `HWCVAL_*` environment variables (pool size, release mode,
/// timeouts, seed, tick period); flags given here override them.
#[derive(Debug, Parser)]
#[command(name = "hwcval-stress", version, about)]
struct Args {
    /// Number of frames to produce.
    #[arg(long, env = "HWCVAL_FRAMES", default_value_t = 120)]
    frames: u64,

    /// Consumer worker threads. More than one lets frames complete out of order.
    #[arg(long, env = "HWCVAL_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Release fence pool size.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Release order: `sequential`, `random` or `retain-oldest`.
    #[arg(long)]
    release_mode: Option<ReleaseMode>,

    /// How many times `retain-oldest` releases the second-oldest slot before the oldest.
    #[arg(long)]
    retain_oldest: Option<u32>,

    /// Fence wait timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Seed for the `random` release mode.
    #[arg(long)]
    seed: Option<u64>,

    /// Signal acquire fences from a free-running vsync timeline.
    #[arg(long)]
    vsync: bool,

    /// Vsync period in microseconds (with `--vsync`).
    #[arg(long)]
    tick_period_us: Option<u64>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    #[arg(long, env = "HWCVAL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn scenario(&self) -> Result<ScenarioConfig> {
        let mut sync = SyncConfig::from_env().context("reading HWCVAL_* environment")?;
        if let Some(pool_size) = self.pool_size {
            if pool_size == 0 {
                bail!("--pool-size must be at least 1");
            }
            sync.pool_size = pool_size;
        }
        if let Some(mode) = self.release_mode {
            sync.release_mode = mode;
        }
        if let Some(n) = self.retain_oldest {
            sync.before_oldest = n;
        }
        if let Some(ms) = self.timeout_ms {
            sync.fence_timeout = Duration::from_millis(ms);
        }
        if self.seed.is_some() {
            sync.random_seed = self.seed;
        }
        if let Some(us) = self.tick_period_us {
            if us == 0 {
                bail!("--tick-period-us must be at least 1");
            }
            sync.tick_period = Duration::from_micros(us);
        }

        Ok(ScenarioConfig {
            frames: self.frames,
            workers: self.workers,
            sync,
            vsync: self.vsync,
            ..ScenarioConfig::default()
        })
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = args.scenario()?;
    let report = run_scenario(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} frames, policy {} (pool {}, {} worker(s)): {} handled, {} immediate / {} blocked waits, \
             {} timeouts, {} pool-full back-offs, {} precondition failures, {} errors",
            report.frames,
            report.policy,
            report.pool_size,
            report.workers,
            report.handled,
            report.immediate_waits,
            report.blocked_waits,
            report.timeouts,
            report.pool_full_backoffs,
            report.precondition_failures,
            report.errors,
        );
    }

    if !report.is_clean() {
        bail!("scenario finished with failures");
    }
    Ok(())
}
