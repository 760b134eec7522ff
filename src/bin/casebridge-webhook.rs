//! casebridge-webhook — receive origin document events and mirror them
//! into the object store.

use casebridge::config::{load_env_file, Config};
use casebridge::object_store::AwsCliStore;
use casebridge::origin::OriginClient;
use casebridge::webhook::{router, WebhookState};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Webhook endpoint for origin-to-object-store propagation.
#[derive(Parser, Debug)]
#[command(name = "casebridge-webhook")]
#[command(about = "Propagate origin document events into the object store")]
struct Args {
    /// Object store bucket, e.g. s3://two-way-sync
    #[arg(value_name = "S3_PATH")]
    s3_path: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

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
    // The webhook router writes objects, not local files; the mirror
    // root is not used on this path.
    let config = Arc::new(Config::build(PathBuf::from("."), &args.s3_path, &env)?);

    let creds = config
        .origin
        .clone()
        .ok_or("origin credentials are required for the webhook router")?;
    let origin = Arc::new(OriginClient::new(config.base_url.clone(), creds));
    let store = Arc::new(AwsCliStore::new(config.bucket.clone()));

    let state = Arc::new(WebhookState::new(config, store, origin));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("webhook router listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
