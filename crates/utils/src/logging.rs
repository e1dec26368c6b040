//! provides logging helpers

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// `RUST_LOG` filter, `info` when unset or unparsable.
pub fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Panics if a global subscriber is already installed, see [`try_init`].
pub fn init() {
    if !try_init() {
        panic!("global tracing subscriber already installed");
    }
}

/// Installs the stderr subscriber unless one is already set. Returns whether it was installed.
pub fn try_init() -> bool {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        try_init();
        assert!(!try_init());
    }
}
