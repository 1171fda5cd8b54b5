//! Tracing subscriber setup for binaries embedding the engine.

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Directive applied on top of `RUST_LOG`.
pub const DEFAULT_DIRECTIVE: &str = "assessrun=info";

/// Build the filter: `RUST_LOG` plus the default directive.
pub fn env_filter() -> Result<EnvFilter, ParseError> {
    Ok(EnvFilter::from_default_env().add_directive(DEFAULT_DIRECTIVE.parse()?))
}

/// Install a global fmt subscriber. Returns false if one was already set.
pub fn init_tracing() -> bool {
    let filter = match env_filter() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(DEFAULT_DIRECTIVE),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
