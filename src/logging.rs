//! Tracing setup with a runtime-reloadable level filter.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the global subscriber. The filter starts from
/// `RUST_LOG` when set, else the provided default level.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = RELOAD_HANDLE.set(handle);
}

/// Swap the active level filter at runtime. Returns the applied directive,
/// or a message describing why the input was rejected.
pub fn set_level(level: &str) -> Result<String, String> {
    let directive = level.trim().to_lowercase();
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| format!("invalid log level {directive:?}: {e}"))?;

    if let Some(handle) = RELOAD_HANDLE.get() {
        handle
            .reload(filter)
            .map_err(|e| format!("failed to apply log level: {e}"))?;
        tracing::info!(level = %directive, "log level updated");
    }
    Ok(directive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert_eq!(set_level(level).unwrap(), level);
        }
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(set_level(" DEBUG ").unwrap(), "debug");
    }

    #[test]
    fn rejects_garbage_directives() {
        assert!(set_level("no=such=level").is_err());
    }
}
