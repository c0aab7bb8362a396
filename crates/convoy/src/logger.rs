//! Leveled logging passed explicitly through the agent.
//!
//! There is no process-global logger. Every component receives a
//! [`Logger`] value and tags its messages with a component prefix
//! (`[main]`, `[rollout]`, `[systemd]`, ...), which keeps log routing a
//! plain function of the call graph.

use std::fmt;

/// Verbosity threshold. Messages at or below the configured level are
/// emitted; `Error` is always emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Parse an operator-supplied level name. Unknown names fall back to
    /// `Info`, matching the configuration file's default.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warning" => LogLevel::Warning,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// A cheap, copyable logger handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warning, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Debug, message.as_ref());
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if level <= self.level {
            eprintln!("{level}: {message}");
        }
    }
}
