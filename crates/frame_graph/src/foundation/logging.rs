//! Logging utilities built on the `log` facade and `env_logger`

pub use log::{debug, error, info, trace, warn};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the logging system
///
/// Honors `RUST_LOG`; falls back to [`DEFAULT_FILTER`]. Panics if a logger is
/// already installed, same as `env_logger::init`.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_FILTER)).init();
}

/// Initialize logging, ignoring the error if a logger is already installed
///
/// Used by tests and by hosts that bring their own logger.
pub fn try_init() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_FILTER))
        .is_test(cfg!(test))
        .try_init()
        .is_ok()
}
