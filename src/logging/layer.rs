//! Bridge from `tracing` events to a [`Handler`].
//!
//! Dependencies (hyper, rustls, reqwest) and the listener loop report through
//! `tracing`. Installing [`ColoredLayer`] on the subscriber renders those
//! events with the same line format as the pipeline's own [`Logger`].
//!
//! [`Logger`]: super::Logger

use std::fmt;
use std::sync::Arc;

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{Attr, Handler, Level, Record, Value};

/// `tracing_subscriber` layer that forwards events to a [`Handler`].
#[derive(Clone)]
pub struct ColoredLayer {
    handler: Arc<dyn Handler>,
}

impl ColoredLayer {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

impl<S: Subscriber> Layer<S> for ColoredLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = Level::from(event.metadata().level());
        if !self.handler.enabled(level) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = Record {
            time: Local::now(),
            level,
            message: &visitor.message,
            attrs: &visitor.attrs,
        };
        let _ = self.handler.handle(&record);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    attrs: Vec<Attr>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.attrs.push(Attr {
                key: field.name(),
                value,
            });
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, Value::Str(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, Value::Int(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, Value::Uint(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, Value::Float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, Value::display(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{ColoredHandler, SharedBuffer, Sink, strip_ansi};
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_tracing_events_render_through_handler() {
        let buffer = SharedBuffer::default();
        let handler: Arc<dyn Handler> =
            Arc::new(ColoredHandler::new(Sink::from(buffer.clone()), Level::Info));
        let subscriber = tracing_subscriber::registry().with(ColoredLayer::new(handler));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("filtered out");
            tracing::warn!(peer = "127.0.0.1:9000", active = 3u64, "Connection rejected");
        });

        let lines: Vec<String> = buffer.lines().iter().map(|l| strip_ansi(l)).collect();
        assert_eq!(lines.len(), 1);
        assert!(
            lines[0].ends_with("WARN Connection rejected peer=127.0.0.1:9000 active=3"),
            "unexpected line: {:?}",
            lines[0]
        );
    }
}
