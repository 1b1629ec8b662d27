use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "stdaudio=debug,warn";

/// Initialize logging with tracing
///
/// - Reads the filter from `RUST_LOG` if set
/// - Falls back to [`DEFAULT_FILTER`]
/// - Uses a formatted output layer
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
///
/// # Example
///
/// ```no_run
/// use stdaudio::utils::logging::init_logging;
///
/// init_logging();
/// ```
pub fn init_logging() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("stdaudio logging initialized");
    }
    installed
}
