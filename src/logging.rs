//! Opt-in tracing setup for binaries and tests. The library itself only
//! emits spans and events; installing a subscriber is the caller's choice.

use tracing::Level;

/// Installs a formatting subscriber at the given level. Safe to call more
/// than once; later calls are no-ops.
pub fn init(level: Level) {
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}

/// `init` at INFO, the conventional default.
pub fn init_default() {
    init(Level::INFO);
}
