//! splitgate edge
//!
//! This service:
//! - Takes over the public listening sockets passed by the supervisor
//! - Tunnels them onto the local HTTP and HTTPS ports
//! - Proxies each request to backend A or B, or redirects it
//! - Serves the rule administration API under `/goproxy`

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use splitgate_edge::{serve, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SPLITGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting splitgate edge");
    info!(
        mode = ?settings.mode,
        http_port = settings.http_port,
        https_port = settings.https_port,
        rules_db = %settings.rules_db.display(),
        ignore_backend_tls_errors = settings.ignore_backend_tls_errors,
        tls = settings.tls.is_some(),
        "Configuration loaded"
    );

    serve::run(Arc::new(settings)).await
}
