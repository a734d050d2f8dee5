use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
pub fn init_subscriber() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
