//! Process logging setup.
//!
//! Library code only emits `tracing` events; embedders that have their own subscriber
//! never need to call [`init_logging`].

use once_cell::sync::OnceCell;

use tracing_subscriber::EnvFilter;

/// Filter directives, in `RUST_LOG` syntax.
pub const LOG_ENV: &str = "SCRIPTFLOW_LOG";
const DEFAULT_FILTER: &str = "info";

static INIT: OnceCell<bool> = OnceCell::new();

/// Installs a global fmt subscriber filtered by `SCRIPTFLOW_LOG`.
///
/// Returns `false` when another subscriber was already installed. Repeated calls return
/// the first call's result.
pub fn init_logging() -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init()
            .is_ok()
    })
}
