// src/infra/logger.rs — Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

/// Pick the filter level from the `-v` count, starting at `default_level`.
pub fn level_for(default_level: &str, verbose: u8) -> &str {
    match verbose {
        0 => default_level,
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,h2=warn")));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
