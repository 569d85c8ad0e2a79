pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    init_from_toml(DEFAULT_CONFIG)
}

/// Builds a logger from a TOML snippet understood by sloggers.
pub fn init_from_toml(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Derives a child logger from an optional parent, or a discarding one.
#[inline]
pub(crate) fn child_or_discard<T>(log: Option<&Logger>, values: slog::OwnedKV<T>) -> Logger
where
    T: slog::SendSyncRefUnwindSafeKV + 'static,
{
    match log {
        Some(log) => log.new(values),
        None => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_toml() {
        let log = init_from_toml(
            r#"
type = "null"
"#,
        );
        trace!(log, "logger built"; "context" => "test");
    }

    #[test]
    fn test_child_or_discard() {
        let root = Logger::root(Discard, o!());
        let child = child_or_discard(Some(&root), o!("id" => 1));
        debug!(child, "child logger");

        let orphan = child_or_discard(None, o!("id" => 2));
        debug!(orphan, "discard logger");
    }
}
