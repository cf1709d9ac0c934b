use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the pipeline.
///
/// Honors `RUST_LOG` when set, defaulting to `mediabatch=debug` otherwise.
/// Production environments get the JSON formatter, everything else the
/// human-readable one.
pub fn init_telemetry(environment: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "mediabatch=debug".into());

    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let env = environment.to_lowercase();
    let registry = tracing_subscriber::registry().with(filter);
    if env == "production" || env == "prod" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(environment = %environment, host = %host, "Telemetry initialized");
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}
