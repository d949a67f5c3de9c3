#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::{self, ShutdownGuard},
    telemetry::tracing::{self, Instrument as _},
};

use clap::Parser;
use rpc_tester_lib::{
    config::Config,
    driver::{Driver, DriverOptions},
};

pub mod reporter;
pub mod utils;

use self::reporter::ReportFormat;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI arguments for configuring rpc-tester behavior.
#[derive(Debug, Clone, Parser)]
#[command(name = "rpc-tester")]
#[command(bin_name = "rpc-tester")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// address to listen on for rpc peers (the port defaults to --port)
    #[arg(long, value_name = "ADDRESS")]
    pub listen: Option<String>,

    /// address of the rpc peer to run the jobs against (the port defaults to --port)
    #[arg(long, value_name = "ADDRESS")]
    pub connect: Option<String>,

    /// port used for listen and connect addresses that carry none
    #[arg(long, default_value_t = 9123)]
    pub port: u16,

    /// yaml job configuration file
    #[arg(long, value_name = "PATH", default_value = "./conf.yaml")]
    pub conf: PathBuf,

    /// duration of every job
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub duration: u64,

    /// amount of shards (threads) to run, one per available core by default
    #[arg(long, value_name = "N")]
    pub shards: Option<usize>,

    /// format of the report written to stdout
    #[arg(long, value_enum, default_value_t = ReportFormat::Yaml)]
    pub format: ReportFormat,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 1.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,

    #[cfg(target_family = "unix")]
    /// Set the limit of max open file descriptors for this process and its children.
    #[arg(long, value_name = "N", default_value_t = 262_144)]
    pub ulimit: rpc_tester_lib::utils::os::rlim_t,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    utils::telemetry::init_tracing(utils::telemetry::TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.as_deref(),
    })?;

    #[cfg(target_family = "unix")]
    {
        use rpc_tester_lib::utils::os;

        let limit = os::raise_nofile(args.ulimit).context("set file descriptor limit")?;
        let shards = args
            .shards
            .unwrap_or_else(rpc_tester_lib::utils::env::default_shard_count);
        let required = os::required_nofile(shards);
        if limit.soft < required {
            tracing::warn!(
                ulimit.soft = limit.soft,
                ulimit.required = required,
                shards,
                "open file limit is below what the shards need",
            );
        }
    }

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

/// Runs all shards and reports their results, or stops early
/// once the (graceful) shutdown has been initiated.
async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let (result_tx, result_rx) = tokio::sync::oneshot::channel::<Result<(), BoxError>>();
    let graceful = graceful::Shutdown::new(new_shutdown_signal(done_rx, base_shutdown_signal));

    graceful.spawn_task_fn(async move |guard| {
        let result = run_load_test(guard, args)
            .instrument(tracing::debug_span!(
                "load test lifetime",
                service.name = rpc_tester_lib::utils::env::project_name(),
            ))
            .await;
        if let Err(err) = &result {
            tracing::error!("load test exited with an error: {err}");
        }
        let _ = result_tx.send(result);
        let _ = done_tx.send(());
    });

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };
    tracing::debug!("gracefully shutdown with a delay of: {delay:?}");

    result_rx
        .await
        .unwrap_or_else(|_| Err(BoxError::from("load test did not report a result")))
}

async fn run_load_test(guard: ShutdownGuard, args: Args) -> Result<(), BoxError> {
    let listen = args
        .listen
        .as_deref()
        .map(|addr| utils::address::resolve_address(addr, args.port))
        .transpose()
        .context("parse --listen address")?;
    let connect = args
        .connect
        .as_deref()
        .map(|addr| utils::address::resolve_address(addr, args.port))
        .transpose()
        .context("parse --connect address")?;

    if listen.is_none() && connect.is_none() {
        return Err(BoxError::from(
            "nothing to do: use --listen and/or --connect",
        ));
    }

    let config = load_config(&args.conf, connect.is_some()).await?;
    let duration = Duration::from_secs(args.duration);
    let options = DriverOptions {
        listen,
        connect,
        shards: args
            .shards
            .unwrap_or_else(rpc_tester_lib::utils::env::default_shard_count),
        duration,
    };

    let reports = tokio::select! {
        result = Driver::new(options, config).run() => result?,
        _ = guard.cancelled() => {
            return Err(BoxError::from(
                "shutdown initiated before all shards completed: no report",
            ));
        }
    };

    args.format.reporter(duration).finish(&reports)
}

/// Load the job file; a pure listener runs without one.
async fn load_config(path: &std::path::Path, required: bool) -> Result<Config, BoxError> {
    if !required && !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::debug!(?path, "no job configuration file: listen only");
        return Ok(Config::default());
    }
    let config = Config::load(path).await?;
    tracing::info!(?path, jobs = config.jobs.len(), "job configuration loaded");
    Ok(config)
}

fn new_shutdown_signal(
    done_rx: tokio::sync::oneshot::Receiver<()>,
    base_shutdown_signal: impl Future<Output: Send + 'static> + Send + 'static,
) -> impl Future + Send + 'static {
    async move {
        tokio::select! {
            _ = base_shutdown_signal => {
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
            _ = done_rx => {
                tracing::debug!("load test is finished, return control");
            }
        }
    }
}
