//! ringmond - time-series monitoring daemon.
//!
//! Ingests collectd metrics over UDP, stores them in per-series
//! multi-resolution files and answers dashboard range queries over HTTP.
//! All storage work runs on a single worker thread; the receiver and the
//! reader only enqueue tasks.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod collectd;
mod http;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use ringmon_core::monitor::Monitor;

/// Time-series monitoring daemon.
#[derive(Parser)]
#[command(name = "ringmond", about = "Time-series monitoring daemon", version = ringmon_core::VERSION)]
struct Args {
    /// Directory holding the per-series data files.
    #[arg(short, long, default_value = "data", env = "RINGMON_DATADIR")]
    datadir: PathBuf,

    /// HTTP listen address for dashboard queries.
    #[arg(short, long, default_value = "0.0.0.0:8070", env = "RINGMON_LISTEN")]
    listen: String,

    /// UDP port for the collectd receiver.
    #[arg(long, default_value_t = collectd::DEFAULT_PORT)]
    collectd_port: u16,

    /// Path to the collectd types.db describing metric value layouts.
    #[arg(long, default_value = "types.db", env = "RINGMON_TYPES_DB")]
    types_db: PathBuf,

    /// Enable the collectd receiver. Disable with --collectd=false to run
    /// a query-only instance.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    collectd: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("ringmond={level}").parse().unwrap())
        .add_directive(format!("ringmon_core={level}").parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("ringmond {} starting", ringmon_core::VERSION);
    info!(
        "Config: datadir={}, listen={}, collectd_port={}",
        args.datadir.display(),
        args.listen,
        args.collectd_port
    );

    let mut monitor = match Monitor::start(&args.datadir) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to start storage worker");
            process::exit(1);
        }
    };
    let queue = monitor.queue();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {e}");
    }

    // collectd receiver on its own thread
    let receiver = if args.collectd {
        match collectd::CollectdReceiver::from_types_db(&args.types_db) {
            Ok(receiver) => {
                match collectd::spawn(
                    Arc::new(receiver),
                    args.collectd_port,
                    queue.clone(),
                    running.clone(),
                ) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!(error = %e, "collectd receiver failed to start");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(
                    "collectd receiver disabled ({}: {e})",
                    args.types_db.display()
                );
                None
            }
        }
    } else {
        info!("collectd receiver disabled");
        None
    };

    // the HTTP reader runs on the tokio runtime until shutdown
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(http::serve(&args.listen, queue, running.clone()));
    if let Err(e) = result {
        error!(error = %e, "reader failed");
        running.store(false, Ordering::SeqCst);
    }

    info!("shutting down...");
    if let Some(handle) = receiver {
        let _ = handle.join();
    }
    // drains queued tasks, then flushes every open series
    monitor.stop();
    info!("shutdown complete");
}
