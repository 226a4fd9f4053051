use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use std::fmt::Write as _;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::{EnvFilter, Targets},
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Target of the user-facing events (stats, confirmations, run summary).
pub const STRESS_TARGET: &str = "stress";

/// Installs the console and hourly-file layers. `RUST_LOG`, when set,
/// replaces the default per-target filters on both layers.
pub fn setup_logger() -> Option<WorkerGuard> {
    std::fs::create_dir_all("logs").ok();

    let file_appender = tracing_appender::rolling::hourly("logs", "stress");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = || EnvFilter::try_from_default_env().ok();

    // File layer: INFO everywhere
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter);
    let file_layer = match env_filter() {
        Some(filter) => file_layer.with_filter(filter).boxed(),
        None => file_layer
            .with_filter(Targets::new().with_default(tracing::Level::INFO))
            .boxed(),
    };

    // Console layer: INFO for stress, WARN for others
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(TerminalFormatter);
    let console_layer = match env_filter() {
        Some(filter) => console_layer.with_filter(filter).boxed(),
        None => console_layer
            .with_filter(
                Targets::new()
                    .with_target(STRESS_TARGET, tracing::Level::INFO)
                    .with_default(tracing::Level::WARN),
            )
            .boxed(),
    };

    if tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        return None;
    }

    // Guard must be kept alive by the caller
    Some(guard)
}

// --- Formatters ---

/// Collects the message and renders the remaining fields as `key=value`.
#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

fn span_prefix<S, N>(ctx: &FmtContext<'_, S, N>) -> String
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let mut prefix = String::new();
    if let Some(scope) = ctx.event_scope() {
        for span in scope.from_root() {
            let ext = span.extensions();
            match ext.get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => {
                    let _ = write!(prefix, "[{} {}] ", span.name(), fields.as_str());
                }
                _ => {
                    let _ = write!(prefix, "[{}] ", span.name());
                }
            }
        }
    }
    prefix
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let level = *event.metadata().level();
        let msg = if level == tracing::Level::ERROR {
            Style::new()
                .fg(Color::LightRed)
                .bold()
                .paint(visitor.message)
                .to_string()
        } else if level == tracing::Level::WARN {
            Color::Yellow.paint(visitor.message).to_string()
        } else if visitor.message.contains("confirmed") {
            visitor.message.replace(
                "confirmed",
                &Style::new()
                    .fg(Color::LightGreen)
                    .bold()
                    .paint("confirmed")
                    .to_string(),
            )
        } else {
            visitor.message
        };

        write!(
            writer,
            "{} {}{}{}",
            Local::now().format("%H:%M:%S"),
            span_prefix(ctx),
            msg,
            Color::DarkGray.paint(visitor.fields)
        )?;
        writeln!(writer)
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = event.metadata().level();

        write!(writer, "{} [{}] {}", timestamp, level, span_prefix(ctx))?;

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        writeln!(writer, "{}{}", visitor.message, visitor.fields)
    }
}
