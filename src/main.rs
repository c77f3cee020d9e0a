use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claude_proxy::{api, config, pid};

#[tokio::main]
async fn main() {
    config::init();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    // Append-only log next to the config; stdout stays the primary sink.
    let log_path = config::config_dir().join("proxy.log");
    let log_file = std::fs::create_dir_all(config::config_dir())
        .ok()
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .ok()
        });
    match log_file {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init(),
        None => {
            registry.init();
            tracing::warn!("could not open {:?}; logging to stdout only", log_path);
        }
    }

    let started_at = chrono::Utc::now().timestamp_millis();
    if let Err(e) = pid::write_lock(started_at) {
        tracing::warn!("failed to write pid lock: {}", e);
    }

    let result = api::start_server(started_at).await;
    pid::remove_lock();

    if let Err(e) = result {
        tracing::error!("gateway exited with error: {:#}", e);
        std::process::exit(1);
    }
}
