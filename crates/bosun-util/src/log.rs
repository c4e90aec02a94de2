//! Logger construction for the bosun binaries.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use slog::{o, Drain as _, LevelFilter, Logger};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Minimum level a log record must have to be emitted. Parses from
/// configuration as one of `debug`, `info`, `warning`, or `error`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_slog_level(self) -> slog::Level {
        match self {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "unknown log level {value:?}: expected debug, info, warning, or error"
            )),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        })
    }
}

/// Build the standard terminal logger and run `body` with it. The logger's
/// async drain is flushed when `body` returns.
pub fn run_with_logger<T>(level: LogLevel, body: impl FnOnce(Logger) -> Result<T>) -> Result<T> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = LevelFilter::new(drain, level.as_slog_level()).fuse();
    let log = Logger::root(drain, o!());
    body(log)
}
