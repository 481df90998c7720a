//! Logger setup shared by the binaries

use log::LevelFilter;

/// Map a configured level name to a filter.
///
/// Unknown or empty names fall back to `warn`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.to_lowercase().as_str() {
        "p" | "panic" | "f" | "fatal" | "e" | "error" => LevelFilter::Error,
        "w" | "warn" | "warning" => LevelFilter::Warn,
        "i" | "info" => LevelFilter::Info,
        "d" | "debug" => LevelFilter::Debug,
        "t" | "trace" | "v" | "verbose" => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    }
}

/// Initialize env_logger at the configured level. `RUST_LOG` wins when set.
pub fn init(level: &str) -> Result<(), log::SetLoggerError> {
    let default = parse_level(level).to_string().to_lowercase();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_secs()
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_aliases() {
        assert_eq!(parse_level("P"), LevelFilter::Error);
        assert_eq!(parse_level("fatal"), LevelFilter::Error);
        assert_eq!(parse_level("e"), LevelFilter::Error);
        assert_eq!(parse_level("Warning"), LevelFilter::Warn);
        assert_eq!(parse_level("i"), LevelFilter::Info);
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("v"), LevelFilter::Trace);
    }

    #[test]
    fn test_unknown_level_defaults_to_warn() {
        assert_eq!(parse_level(""), LevelFilter::Warn);
        assert_eq!(parse_level("loud"), LevelFilter::Warn);
    }
}
