//! Console handler with ANSI-colored level tags.

use std::fmt::Write as _;
use std::sync::Arc;

use super::{Attr, Handler, Level, Record, Sink};

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_YELLOW: &str = "\x1b[33m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BLUE: &str = "\x1b[34m";
const COLOR_GRAY: &str = "\x1b[90m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => COLOR_RED,
        Level::Warn => COLOR_YELLOW,
        Level::Info => COLOR_GREEN,
        Level::Debug => COLOR_BLUE,
    }
}

/// Renders each record as one colored line and writes it to a [`Sink`].
///
/// Bound attributes are shared behind an `Arc<[Attr]>`; deriving a handler
/// copies the slice once and never touches the original.
#[derive(Clone)]
pub struct ColoredHandler {
    output: Sink,
    level: Level,
    attrs: Arc<[Attr]>,
}

impl ColoredHandler {
    pub fn new(output: Sink, level: Level) -> Self {
        Self {
            output,
            level,
            attrs: Arc::from(Vec::new()),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Attributes bound through `with_attrs`, oldest first.
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    fn render(&self, record: &Record<'_>) -> String {
        let mut line = String::with_capacity(256);

        line.push_str(COLOR_GRAY);
        line.push_str(&record.time.format("%H:%M:%S").to_string());
        line.push(' ');
        line.push_str(level_color(record.level));
        line.push_str(record.level.as_str());
        line.push_str(COLOR_RESET);

        line.push(' ');
        line.push_str(record.message);

        for attr in record.attrs.iter().chain(self.attrs.iter()) {
            let _ = write!(line, " {attr}");
        }

        line.push('\n');
        line
    }
}

impl Handler for ColoredHandler {
    fn enabled(&self, level: Level) -> bool {
        level >= self.level
    }

    fn handle(&self, record: &Record<'_>) -> std::io::Result<()> {
        self.output.write_line(self.render(record).as_bytes())
    }

    fn with_attrs(self: Arc<Self>, attrs: &[Attr]) -> Arc<dyn Handler> {
        let mut combined = Vec::with_capacity(self.attrs.len() + attrs.len());
        combined.extend_from_slice(&self.attrs);
        combined.extend_from_slice(attrs);

        Arc::new(ColoredHandler {
            output: self.output.clone(),
            level: self.level,
            attrs: Arc::from(combined),
        })
    }

    fn with_group(self: Arc<Self>, _name: &str) -> Arc<dyn Handler> {
        self
    }
}
