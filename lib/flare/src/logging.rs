pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_LEVEL: &str = "info";

/// Builds the root terminal logger writing to stderr at the default level.
pub fn init() -> Logger {
    init_with_level(DEFAULT_LEVEL)
}

/// Builds the root terminal logger writing to stderr at the supplied level
/// (one of `trace`, `debug`, `info`, `warning`, `error`, `critical`).
pub fn init_with_level(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logging configuration");

    config.build_logger().expect("Error building root logger")
}
