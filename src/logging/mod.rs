//! Leveled, attributed logging for the interception pipeline.
//!
//! Every pipeline stage reports through an explicit [`Logger`] value rather
//! than a process-global sink. A `Logger` wraps a [`Handler`]; deriving a
//! scoped logger with [`Logger::with`] never mutates the parent, so one base
//! logger can be shared across concurrently served requests and specialised
//! per request without coordination.
//!
//! # Line format
//!
//! ```text
//! <gray>15:04:05 <color>WARN<reset> Response too large, skipping validation size=20971520 declared=true
//! ```
//!
//! Call-site attributes render first, followed by attributes bound through
//! [`Logger::with`] in the order they were bound.

mod colored;
pub mod layer;
mod sink;

pub use colored::ColoredHandler;
pub use layer::ColoredLayer;
pub use sink::{SharedBuffer, Sink, strip_ansi};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use thiserror::Error;

/// Severity of a log record.
///
/// Ordered `Debug < Info < Warn < Error`; a handler configured with a
/// minimum level emits every record at or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Verbose diagnostics (sanitized headers, per-stage decisions).
    Debug,
    /// Normal operation (startup, access log).
    Info,
    /// Skipped responses and undocumented endpoints.
    Warn,
    /// Validation failures and internal resolver errors.
    Error,
}

impl Level {
    /// Upper-case tag used in rendered lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a log level name is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid log level '{0}': must be one of 'debug', 'info', 'warn', or 'error'")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::INFO => Level::Info,
            _ => Level::Debug,
        }
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl Value {
    /// Capture any displayable value as a string attribute.
    pub fn display(value: impl fmt::Display) -> Self {
        Value::Str(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Uint(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

macro_rules! impl_value_from_int {
    ($variant:ident as $target:ty: $($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::$variant(n as $target)
                }
            }
        )*
    };
}

impl_value_from_int!(Int as i64: i8, i16, i32, i64);
impl_value_from_int!(Uint as u64: u8, u16, u32, u64, usize);

impl From<http::StatusCode> for Value {
    fn from(status: http::StatusCode) -> Self {
        Value::Uint(u64::from(status.as_u16()))
    }
}

impl From<&http::Method> for Value {
    fn from(method: &http::Method) -> Self {
        Value::Str(method.as_str().to_string())
    }
}

/// A `key=value` pair attached to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub key: &'static str,
    pub value: Value,
}

impl Attr {
    pub fn new(key: &'static str, value: impl Into<Value>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A single emission, borrowed for the duration of [`Handler::handle`].
#[derive(Debug, Clone)]
pub struct Record<'a> {
    pub time: DateTime<Local>,
    pub level: Level,
    pub message: &'a str,
    pub attrs: &'a [Attr],
}

/// Renders records to an output.
///
/// Implementations must be immutable values: [`Handler::with_attrs`] returns
/// a new handler and leaves `self` untouched.
pub trait Handler: Send + Sync {
    /// Returns `true` if records at `level` would be emitted.
    fn enabled(&self, level: Level) -> bool;

    /// Render and write one record.
    fn handle(&self, record: &Record<'_>) -> std::io::Result<()>;

    /// Returns a handler that appends `attrs` to every record it renders.
    fn with_attrs(self: Arc<Self>, attrs: &[Attr]) -> Arc<dyn Handler>;

    /// Grouping is not supported; returns the same handler.
    fn with_group(self: Arc<Self>, name: &str) -> Arc<dyn Handler>;
}

/// Cheaply cloneable front-end over a [`Handler`].
#[derive(Clone)]
pub struct Logger {
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }

    /// Colored logger writing to standard error.
    pub fn stderr(level: Level) -> Self {
        Self::new(Arc::new(ColoredHandler::new(Sink::stderr(), level)))
    }

    /// Logger that drops everything below `Error` and writes nowhere.
    pub fn discard() -> Self {
        Self::new(Arc::new(ColoredHandler::new(Sink::discard(), Level::Error)))
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn enabled(&self, level: Level) -> bool {
        self.handler.enabled(level)
    }

    /// Derive a logger whose records carry `attrs` after call-site attributes.
    #[must_use]
    pub fn with(&self, attrs: &[Attr]) -> Logger {
        Logger::new(Arc::clone(&self.handler).with_attrs(attrs))
    }

    #[must_use]
    pub fn with_group(&self, name: &str) -> Logger {
        Logger::new(Arc::clone(&self.handler).with_group(name))
    }

    pub fn log(&self, level: Level, message: &str, attrs: &[Attr]) {
        if !self.handler.enabled(level) {
            return;
        }
        let record = Record {
            time: Local::now(),
            level,
            message,
            attrs,
        };
        // Diagnostic output; a failed write has nowhere else to go.
        let _ = self.handler.handle(&record);
    }

    pub fn debug(&self, message: &str, attrs: &[Attr]) {
        self.log(Level::Debug, message, attrs);
    }

    pub fn info(&self, message: &str, attrs: &[Attr]) {
        self.log(Level::Info, message, attrs);
    }

    pub fn warn(&self, message: &str, attrs: &[Attr]) {
        self.log(Level::Warn, message, attrs);
    }

    pub fn error(&self, message: &str, attrs: &[Attr]) {
        self.log(Level::Error, message, attrs);
    }
}
