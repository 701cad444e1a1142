use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
///
/// `RUST_LOG` selects the filter (default `info`). `LOG_FORMAT=json` switches to JSON lines.
pub async fn init() -> Result<(), SetGlobalDefaultError> {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    // Setup tracing layers
    let (json_logger, logger) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().compact()))
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let collector = Registry::default()
        .with(json_logger)
        .with(logger)
        .with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)
}
