use std::env;

use simplelog::{ConfigBuilder, TermLogger};

/// Environment variable holding the log level (`error` .. `trace`).
pub const LOG_ENV_VAR: &str = "CAPTURE_LOG";

fn level_from(value: Option<String>) -> log::LevelFilter {
    value
        .and_then(|level| level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info)
}

/// Installs the terminal logger. Errors go to stderr, the rest to stdout.
pub fn init() -> Result<(), log::SetLoggerError> {
    let config = ConfigBuilder::new()
        .set_time_level(log::LevelFilter::Debug)
        .build();

    TermLogger::init(
        level_from(env::var(LOG_ENV_VAR).ok()),
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
}
