//! Tracing setup shared by the client and the daemon binaries

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, `RUST_LOG` syntax
pub const ENV_LOG: &str = "WARMC_LOG";

/// Levels in increasing verbosity
const LEVELS: [LevelFilter; 6] = [
    LevelFilter::OFF,
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Global level after `verbosity` steps above `default_level`
pub fn raised_level(default_level: LevelFilter, verbosity: u8) -> Option<LevelFilter> {
    if verbosity == 0 {
        return None;
    }
    let base = LEVELS.iter().position(|l| *l == default_level).unwrap_or(2);
    let index = (base + verbosity as usize).min(LEVELS.len() - 1);
    Some(LEVELS[index])
}

/// Install a stderr subscriber.
///
/// `WARMC_LOG` wins over `default_level`; each `-v` then raises the global
/// level one step without touching per-module directives.
pub fn init(default_level: LevelFilter, verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();

    let filter = match raised_level(default_level, verbosity) {
        Some(level) => filter.add_directive(level.into()),
        None => filter,
    };

    // A second install (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
