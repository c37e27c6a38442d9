//! Tracing setup: compact terminal output plus a daily rolling log file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::Path;

/// Longest rendered `message` field, in characters.
const MAX_MESSAGE_CHARS: usize = 280;

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the `debug` flag when set. The returned guard flushes
/// the file writer on drop, so hold it for the life of the process.
pub fn init(log_dir: &Path, debug: bool) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "crosspost.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let field_formatter = || {
        format::debug_fn(|writer, field, value| {
            let field_name = field.name();
            if field_name == "message" {
                let formatted = format!("{value:?}");
                let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
                if was_truncated {
                    write!(writer, "{field_name}={truncated}...")
                } else {
                    write!(writer, "{field_name}={formatted}")
                }
            } else {
                write!(writer, "{field_name}={value:?}")
            }
        })
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_formatter())
        .compact();
    let terminal_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_formatter())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(terminal_layer)
        .with(file_layer)
        .init();

    guard
}

fn build_env_filter(debug: bool) -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::from_default_env();
    }
    if debug {
        // Gateway chatter drowns everything else at debug.
        EnvFilter::new("debug,serenity=info,h2=info,hyper=info,rustls=info")
    } else {
        EnvFilter::new("info")
    }
}
