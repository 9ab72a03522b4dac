use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than
/// once keeps the first subscriber.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Subscriber for tests, routed through the test harness output.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("querier=debug,info")
        .with_test_writer()
        .try_init();
}
