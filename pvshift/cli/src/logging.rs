use tracing_subscriber::{prelude::*, EnvFilter};

/// Logs go to stderr, stdout belongs to progress output.
///
/// `RUST_LOG` wins over `--debug`.
pub(crate) fn init_tracing_registry(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::builder().parse_lossy(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
