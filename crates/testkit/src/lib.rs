#![warn(missing_docs)]
//! Test surfaces for replication sessions: replicated test classes, a
//! loopback host/client harness, and JSON traffic reports.

mod classes;
mod harness;
mod metrics;

use std::sync::Once;

pub use classes::*;
pub use harness::*;
pub use metrics::*;

/// Install a test-writer tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
