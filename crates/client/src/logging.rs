//! Structured logging for the sync client.
//!
//! Events always go to `<data dir>/logs/client.log` through a non-blocking
//! writer. Long-running commands can mirror them to stderr in a compact form.
//! Format and filter come from `SyncConfig::log`, so the config file and env
//! layering apply to them like any other setting.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::config::DataPaths;

pub const DEFAULT_FILTER: &str = "info,orbitdock_client=debug,tungstenite=warn,reqwest=warn";
const LOG_FILE: &str = "client.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `EnvFilter` directives; `DEFAULT_FILTER` when unset.
    pub filter: Option<String>,
    /// Mirror events to stderr as well as the file.
    pub stderr: bool,
}

pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    /// Flushes the file writer on drop.
    pub guard: WorkerGuard,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(paths: &DataPaths, settings: &LogSettings) -> anyhow::Result<LoggingHandle> {
    let (subscriber, guard, log_path) = build_subscriber(paths, settings)?;
    subscriber.try_init()?;

    let run_id = Uuid::new_v4().to_string();
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = settings.format.as_str(),
        stderr = settings.stderr,
        filter = %filter_directives(settings),
    );
    Ok(LoggingHandle {
        run_id,
        log_path,
        guard,
    })
}

fn build_subscriber(
    paths: &DataPaths,
    settings: &LogSettings,
) -> anyhow::Result<(impl Subscriber + Send + Sync, WorkerGuard, PathBuf)> {
    let log_dir = paths.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        &log_dir, LOG_FILE,
    ));
    let file: BoxedLayer = match settings.format {
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };
    let mut layers = vec![file];
    if settings.stderr {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_target(false)
                .boxed(),
        );
    }

    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&filter_directives(settings)));
    Ok((subscriber, guard, log_dir.join(LOG_FILE)))
}

fn filter_directives(settings: &LogSettings) -> String {
    settings
        .filter
        .clone()
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Bad directives fall back to the default rather than silencing the log.
fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!(LogFormat::parse(" Pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn unset_filter_uses_default() {
        assert_eq!(filter_directives(&LogSettings::default()), DEFAULT_FILTER);
        let settings = LogSettings {
            filter: Some("warn".into()),
            ..Default::default()
        };
        assert_eq!(filter_directives(&settings), "warn");
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let filter = build_filter("orbitdock_client=notalevel");
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn json_events_land_in_the_client_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path());
        let (subscriber, guard, log_path) =
            build_subscriber(&paths, &LogSettings::default()).expect("subscriber");

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(component = "engine", event = "engine.started", "Sync engine started");
            tracing::trace!(component = "engine", event = "engine.noise");
        });
        drop(guard);

        let written = std::fs::read_to_string(&log_path).expect("log file");
        let line = written.lines().next().expect("one event");
        let value: serde_json::Value = serde_json::from_str(line).expect("json line");
        assert_eq!(value["event"], "engine.started");
        assert_eq!(value["component"], "engine");
        assert!(!written.contains("engine.noise"));
    }
}
