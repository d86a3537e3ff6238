use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LEVEL: &str = "warn";

fn filter_directive(verbose: bool) -> String {
    if verbose {
        return "debug".to_string();
    }
    for var in ["VOXTALLY_LOG", "RUST_LOG"] {
        if let Ok(v) = env::var(var)
            && !v.trim().is_empty()
        {
            return v.trim().to_string();
        }
    }
    DEFAULT_LEVEL.to_string()
}

/// Install the stderr subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init(verbose: bool) {
    let directive = filter_directive(verbose);
    let env_filter =
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(false),
        )
        .try_init();
}
