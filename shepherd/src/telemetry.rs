//! Process-level tracing bootstrap shared by the binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber: `RUST_LOG` filtering with an
/// `info` default and a compact terminal format.
///
/// Called once at the top of each binary's `main`; a second call would
/// panic on the global-default registration, so the library itself never
/// invokes it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}
