//! A `tracing` layer that records events into a bounded in-memory buffer.
//!
//! The CLI echoes lines to stderr; the web server exposes the buffer at
//! `GET /api/logs`. The buffer has its own mutex, so logging from tokio
//! workers never contends with anything else.
//!
//! ```ignore
//! let (layer, logs) = LogLayer::new();
//! tracing_subscriber::registry()
//!     .with(layer.with_echo(LogLevel::Info))
//!     .init();
//! ```

use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::registry::LookupSpan;

/// Lines kept before the buffer is trimmed.
pub const MAX_LOG_LINES: usize = 2000;
/// Lines left after a trim.
pub const LOG_TRIM_TO: usize = 1200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Short fixed-width label for display.
    pub fn label(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO ",
            Self::Warn => "WARN ",
            Self::Error => "ERROR",
        }
    }

    fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub time: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!("{} {} {}", self.time, self.level.label(), self.message)
    }
}

/// Shared, bounded buffer of captured log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<LogLine>>>);

impl LogBuffer {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogLine>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, line: LogLine) {
        let mut buf = self.lock();
        buf.push(line);
        if buf.len() > MAX_LOG_LINES {
            let trim = buf.len() - LOG_TRIM_TO;
            buf.drain(..trim);
        }
    }

    /// Remove and return every buffered line.
    pub fn drain(&self) -> Vec<LogLine> {
        std::mem::take(&mut *self.lock())
    }

    /// The newest `limit` lines at or above `min_level`, oldest first.
    pub fn recent(&self, limit: usize, min_level: LogLevel) -> Vec<LogLine> {
        let buf = self.lock();
        let mut lines: Vec<LogLine> = buf
            .iter()
            .rev()
            .filter(|l| l.level >= min_level)
            .take(limit)
            .cloned()
            .collect();
        lines.reverse();
        lines
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Captures events into a [`LogBuffer`] and optionally echoes them to stderr.
pub struct LogLayer {
    buffer: LogBuffer,
    capture_level: LogLevel,
    echo_level: Option<LogLevel>,
}

impl LogLayer {
    /// Create a layer and the buffer it writes to. Captures DEBUG and above.
    pub fn new() -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (
            Self {
                buffer: buffer.clone(),
                capture_level: LogLevel::Debug,
                echo_level: None,
            },
            buffer,
        )
    }

    pub fn with_capture_level(mut self, level: LogLevel) -> Self {
        self.capture_level = level;
        self
    }

    /// Also print lines at or above `level` to stderr.
    pub fn with_echo(mut self, level: LogLevel) -> Self {
        self.echo_level = Some(level);
        self
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for LogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = LogLevel::from_tracing(event.metadata().level());
        let echo = self.echo_level.is_some_and(|min| level >= min);
        if level < self.capture_level && !echo {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            let extras: Vec<String> = visitor.fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            if message.is_empty() {
                message = extras.join(" ");
            } else {
                message = format!("{message} {{{}}}", extras.join(", "));
            }
        }

        let line = LogLine {
            time: Local::now().format("%H:%M:%S").to_string(),
            level,
            target: event.metadata().target().to_string(),
            message,
        };
        if echo {
            eprintln!("{}", line.render());
        }
        if level >= self.capture_level {
            self.buffer.push(line);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let raw = format!("{value:?}");
        if field.name() == "message" {
            self.message = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(str::to_string)
                .unwrap_or(raw);
        } else {
            self.fields.push((field.name().to_string(), raw));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}
