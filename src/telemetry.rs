use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings, project_dirs};

const CRATE_TARGET: &str = "profile_router";
const TRACE_SUFFIX: &str = "trace.jsonl";

/// Keeps the background trace writer alive. Hold it until `main` returns.
#[must_use = "dropping the guard stops trace export"]
pub struct TelemetryGuard {
    _trace_writer: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Console output goes to stderr, since the native host owns stdout, and
/// follows `RUST_LOG`. The optional trace file records everything this crate
/// emits down to `TRACE`, independent of the console level.
pub fn init_tracing(
    service: &str,
    verbose: bool,
    telemetry: &TelemetrySettings,
) -> Result<TelemetryGuard> {
    let default_directive = if verbose {
        "profile_router=debug"
    } else {
        "profile_router=info"
    };
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let (trace, guard) = match trace_appender(service, &telemetry.traces)? {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(trace_layer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(trace)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(TelemetryGuard {
        _trace_writer: guard,
    })
}

/// JSON lines for this crate only. Each event carries its enclosing span, so
/// routing logs keep the `router.navigation` span's `url` and
/// `from_app_context`.
fn trace_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(Targets::new().with_target(CRATE_TARGET, LevelFilter::TRACE))
}

/// Daily `<service>.<date>.trace.jsonl` files, keeping at most `max_files`.
fn trace_appender(service: &str, settings: &TraceSettings) -> Result<Option<RollingFileAppender>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = trace_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(service)
        .filename_suffix(TRACE_SUFFIX);
    if settings.max_files > 0 {
        builder = builder.max_log_files(settings.max_files);
    }
    let appender = builder
        .build(&directory)
        .with_context(|| format!("Failed to open trace files in {}", directory.display()))?;
    Ok(Some(appender))
}

fn trace_directory(settings: &TraceSettings) -> Result<PathBuf> {
    match &settings.directory {
        Some(dir) => Ok(dir.clone()),
        None => Ok(project_dirs()?.cache_dir().join("traces")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::{debug, info, info_span};

    fn read_traces(dir: &std::path::Path) -> Vec<(String, String)> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let body = fs::read_to_string(entry.path()).unwrap();
                (name, body)
            })
            .collect()
    }

    #[test]
    fn disabled_traces_open_nothing() {
        let settings = TraceSettings::default();
        assert!(trace_appender("router", &settings).unwrap().is_none());
    }

    #[test]
    fn trace_file_keeps_navigation_context() {
        let dir = tempdir().unwrap();
        let settings = TraceSettings {
            enabled: true,
            directory: Some(dir.path().join("traces")),
            max_files: 3,
        };
        let appender = trace_appender("router", &settings).unwrap().unwrap();
        let subscriber = tracing_subscriber::registry().with(trace_layer(appender));

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!(
                "router.navigation",
                url = "https://a.com/docs",
                from_app_context = false
            );
            let _entered = span.enter();
            debug!(profile = "Profile 1", "remembered mapping matched");
            info!(target: "rusqlite", "unrelated dependency chatter");
        });

        let traces = read_traces(&dir.path().join("traces"));
        assert_eq!(traces.len(), 1);
        let (name, body) = &traces[0];
        assert!(name.starts_with("router."), "{name}");
        assert!(name.ends_with(TRACE_SUFFIX), "{name}");

        let line: serde_json::Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(line["fields"]["message"], "remembered mapping matched");
        assert_eq!(line["fields"]["profile"], "Profile 1");
        assert_eq!(line["span"]["name"], "router.navigation");
        assert_eq!(line["span"]["url"], "https://a.com/docs");
        assert!(!body.contains("unrelated dependency chatter"));
    }
}
