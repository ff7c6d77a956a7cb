pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the terminal logger used by the service binaries. Writes to
/// stderr so the protocol stream on stdout stays clean.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}
