//! Shared test-only setup. Initializes a `tracing_subscriber` the way the
//! teacher's `main.rs` sets one up for the real process, scaled down to
//! what `cargo test` needs: a stderr layer gated by `RUST_LOG`, captured by
//! the test harness instead of a log file.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber on the first call; later calls
/// from other tests are no-ops, since `tracing::subscriber::set_global_default`
/// may only be called once per process.
pub fn init_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
