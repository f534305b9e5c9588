//! Console log format for the decai node.
//!
//! Lines look like `[timestamp] [decai-session   ] [ℹ INFO   ] message key=value`.
//! The bracketed source is `decai-<component>` when the event carries a
//! `component` field, otherwise the service name.

use std::fmt;
use std::fmt::Write as _;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// Log with a `component` field, e.g. `component_info!("serve", "Listening on {}", addr)`
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Warning with a `component` field
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Debug event with a `component` field
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Error with a `component` field
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter used by the `decai` binary
pub struct DecaiLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl DecaiLogFormatter {
    /// Formatter for `service_name`; colors follow the terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Force colors on or off
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    fn format_source(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SOURCE_WIDTH {
            let truncated: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn format_level(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn color_for(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, fields: &FieldVisitor) -> String {
        let (cyan, color, reset) = if self.color_enabled {
            (COLOR_CYAN, self.color_for(level), COLOR_RESET)
        } else {
            ("", "", "")
        };

        let mut line = format!(
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            self.format_source(fields.component.as_deref()),
            color,
            Self::format_level(level),
            reset,
            fields.message
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for DecaiLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(
            writer,
            "{}",
            self.render(&timestamp, event.metadata().level(), &visitor)
        )
    }
}

/// Collects the message, the component and any other fields of an event
#[derive(Debug, Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn store(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            other => self.extra.push((other, value)),
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        self.store(field.name(), text);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.store(field.name(), value.to_string());
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}
