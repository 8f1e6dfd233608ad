//! Structured logging facade. Runtime objects carry child loggers derived
//! from the logger handed to the engine; binaries bootstrap a terminal
//! logger from an embedded TOML snippet.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Build a terminal logger writing to stderr at the given level
/// (`trace`, `debug`, `info`, `warning`, `error`, `critical`).
pub fn terminal(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that drops everything. Used where no parent logger is supplied.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_config_parses() {
        let log = terminal("debug");
        trace!(log, "filtered out by level");
    }

    #[test]
    fn test_discard_logger() {
        let log = discard();
        debug!(log, "never seen"; "key" => 1);
    }
}
