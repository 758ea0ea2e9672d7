//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; applications decide whether to
//! install a subscriber. These helpers install the stderr formatter used by
//! our own tools and tests.

use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber
///
/// With `debug` every event is shown, otherwise `RUST_LOG` (default `info`)
/// decides. Calling it again is a no-op.
pub fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Install a subscriber whose output is captured by the test harness
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("reprobundle=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
        init_tracing(true);
        tracing::debug!("still alive");
    }
}
