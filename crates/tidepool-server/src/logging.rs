use tracing_subscriber::EnvFilter;

/// Installs the process-wide JSON subscriber. Call once from the binary;
/// library users bring their own subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .init();

    tracing::info!(service = crate::SERVICE_NAME, "logging initialized");
}
