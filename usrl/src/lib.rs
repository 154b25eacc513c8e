pub mod bench;
pub mod config;
pub mod monitor;

/// Installs the `tracing` subscriber used by every binary: `RUST_LOG`
/// filtering with `info` as the default level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
