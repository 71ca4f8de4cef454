//! Log output setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, `RUST_LOG` syntax.
pub const ENV_LOG: &str = "QI_LOG";

/// Filter used when neither `QI_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    std::env::var(ENV_LOG)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a `fmt` subscriber filtered by `QI_LOG`, then `RUST_LOG`.
///
/// Does nothing when a global subscriber is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

/// Like [`init_tracing`], writing through the test harness capture.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(env_filter())
        .try_init();
}
