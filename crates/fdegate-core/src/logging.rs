//! Process-wide logger setup.

use env_logger::{Builder, Env};

/// Install the global logger, honouring `RUST_LOG` and falling back to
/// `default_level`. Calling this more than once is harmless.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = Builder::from_env(env)
        .format_timestamp_secs()
        .format_target(true)
        .try_init();
}
