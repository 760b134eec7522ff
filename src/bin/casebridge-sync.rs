//! casebridge-sync — keep a local mirror and an object store converged.
//!
//! Discovers projects on both sides, hydrates newcomers, then runs
//! watchers and a poll loop until interrupted.

use casebridge::config::{load_env_file, Config};
use casebridge::object_store::AwsCliStore;
use casebridge::orchestrator::{acquire_sync_lock, Orchestrator};
use casebridge::origin::OriginClient;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Two-way sync between a local mirror tree and an object store.
#[derive(Parser, Debug)]
#[command(name = "casebridge-sync")]
#[command(about = "Sync a local mirror tree with an S3-compatible object store")]
struct Args {
    /// Local mirror root (one subdirectory per project)
    #[arg(value_name = "ZDRIVE_ROOT")]
    zdrive_root: PathBuf,

    /// Object store bucket, e.g. s3://two-way-sync
    #[arg(value_name = "S3_PATH")]
    s3_path: String,

    /// Env file with origin credentials and layout settings
    #[arg(short, long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casebridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let env = load_env_file(args.env_file.as_deref())?;
    let config = Arc::new(Config::build(args.zdrive_root, &args.s3_path, &env)?);

    // Held for the life of the process; released on exit.
    let _lock = acquire_sync_lock(&config.mirror_root)?;

    let store = Arc::new(AwsCliStore::new(config.bucket.clone()));
    let origin = config
        .origin
        .clone()
        .map(|creds| Arc::new(OriginClient::new(config.base_url.clone(), creds)));

    info!(
        "syncing {} <-> s3://{}/{}",
        config.mirror_root.display(),
        config.bucket,
        config.root_prefix
    );

    let orchestrator = Arc::new(Orchestrator::new(config, store, origin));

    tokio::select! {
        result = orchestrator.run() => {
            if let Err(e) = result {
                error!("orchestrator stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }
    Ok(())
}
