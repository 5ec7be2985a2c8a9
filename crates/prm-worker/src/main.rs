//! pr-monitor entry point.
//!
//! This file is intentionally thin: parse the CLI, set up tracing, build
//! the worker and hand over to the supervisor loop. All wiring lives in
//! `supervisor.rs`; route handlers live in `routes.rs`.

use clap::Parser;
use tracing::error;

use prm_worker::supervisor::Worker;

#[derive(Debug, Parser)]
#[command(name = "pr-monitor", about = "Scheduled pull-request discovery worker")]
struct Args {
    /// Configuration file path (YAML). Later files override earlier ones.
    #[arg(long)]
    config: Vec<String>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let args = Args::parse();
    init_tracing(&args.log_level);

    let worker = match Worker::initialize(&args.config).await {
        Ok(worker) => worker,
        Err(e) => {
            error!("worker initialization failed: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = worker.run().await {
        error!("worker exited with error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .init();
}
