use std::fmt;
use std::thread;

use ansi_term::Colour;
use chrono::Utc;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

pub const LOG_ENV: &str = "MSG_HANDLER_LOG";

fn level_label(level: &Level) -> (&'static str, Colour) {
    match *level {
        Level::TRACE => ("TRACE", Colour::Purple),
        Level::DEBUG => ("DEBUG", Colour::Blue),
        Level::INFO => (" INFO", Colour::Green),
        Level::WARN => (" WARN", Colour::Yellow),
        Level::ERROR => ("ERROR", Colour::Red),
    }
}

/// `[timestamp LEVEL thread file:line] fields`, shared by the stdout and
/// the file layer. The thread column tells the message task and the
/// inference task apart.
struct HandlerFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for HandlerFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let (label, colour) = level_label(metadata.level());
        let current = thread::current();

        write!(writer, "[{} ", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"))?;
        if self.ansi && writer.has_ansi_escapes() {
            write!(writer, "{}", colour.paint(label))?;
        } else {
            write!(writer, "{}", label)?;
        }
        write!(
            writer,
            " {} {}:{}] ",
            current.name().unwrap_or("<unnamed>"),
            metadata.file().unwrap_or("<unknown>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. Events go to stdout, and to `log_file`
/// as well when one is configured; the returned guard flushes that file on
/// drop.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let env_filter = || -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::builder()
            .with_default_directive(config.log_level.parse()?)
            .with_env_var(LOG_ENV)
            .from_env_lossy())
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(HandlerFormatter { ansi })
        .with_filter(env_filter()?);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let guard = match &config.log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(HandlerFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_filter(env_filter()?);
            registry.with(file_layer).try_init()?;
            Some(guard)
        }
        None => {
            registry.try_init()?;
            None
        }
    };

    tracing::info!("tracing-log initialized");
    Ok(guard)
}
