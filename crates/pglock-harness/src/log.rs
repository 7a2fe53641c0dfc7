//! Test logging.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test writer at `DEBUG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::DEBUG);
}

/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}
