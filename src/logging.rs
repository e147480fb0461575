//! Per-montage log files.
//!
//! Workers run inside a span carrying a `montage` field. [`MontageLogLayer`]
//! looks that field up for every event and appends the formatted line to
//! `<dir>/<montage>.log`, so concurrent montages never share a file.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt as tfmt};

pub const MONTAGE_FIELD: &str = "montage";
pub const BATCH_LOG: &str = "batch";

/// Log file a montage's worker writes to.
pub fn montage_log_path(dir: &Path, montage: &str) -> PathBuf {
    dir.join(format!("{}.log", montage))
}

struct MontageName(String);

#[derive(Default)]
struct MontageVisitor(Option<String>);

impl Visit for MontageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == MONTAGE_FIELD {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MONTAGE_FIELD {
            self.0 = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }
}

struct LineVisitor<'a>(&'a mut String);

impl Visit for LineVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            let _ = write!(self.0, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

pub struct MontageLogLayer {
    dir: PathBuf,
    batch: Option<String>,
    files: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl MontageLogLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            batch: None,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Events outside any montage span go to `<dir>/<name>.log`.
    pub fn with_batch_file(mut self, name: impl Into<String>) -> Self {
        self.batch = Some(name.into());
        self
    }

    fn file_for(&self, name: &str) -> Option<Arc<Mutex<File>>> {
        let mut files = self.files.lock().ok()?;
        if let Some(file) = files.get(name) {
            return Some(file.clone());
        }
        std::fs::create_dir_all(&self.dir).ok()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(montage_log_path(&self.dir, name))
            .ok()?;
        let file = Arc::new(Mutex::new(file));
        files.insert(name.to_string(), file.clone());
        Some(file)
    }
}

impl<S> Layer<S> for MontageLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = MontageVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(name), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(MontageName(name));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let montage = ctx.event_scope(event).and_then(|scope| {
            scope
                .into_iter()
                .find_map(|span| span.extensions().get::<MontageName>().map(|m| m.0.clone()))
        });
        let Some(target) = montage.or_else(|| self.batch.clone()) else {
            return;
        };
        let Some(file) = self.file_for(&target) else {
            return;
        };

        let meta = event.metadata();
        let mut line = format!(
            "{} {:>5} {}: ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            meta.level(),
            meta.target()
        );
        event.record(&mut LineVisitor(&mut line));
        line.push('\n');

        if let Ok(mut file) = file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Console output filtered by `RUST_LOG` (default `info`), plus per-montage
/// files under `log_dir` at debug level so external tool output is kept.
pub fn init(log_dir: &Path) {
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tfmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    let files = MontageLogLayer::new(log_dir)
        .with_batch_file(BATCH_LOG)
        .with_filter(LevelFilter::DEBUG);

    // A second init (tests, repeated runs in one process) keeps the first.
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(files)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{Instrument, info, info_span};

    #[test]
    fn events_are_routed_by_montage_span() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(MontageLogLayer::new(dir.path()).with_batch_file(BATCH_LOG));
        tracing::subscriber::with_default(subscriber, || {
            info!("batch starting");
            info_span!("worker", montage = "alpha").in_scope(|| {
                info!(stage = "solve", "solving alpha");
                info_span!("inner").in_scope(|| info!("nested alpha"));
            });
            info_span!("worker", montage = %"beta").in_scope(|| info!("solving beta"));
        });

        let alpha = std::fs::read_to_string(montage_log_path(dir.path(), "alpha")).unwrap();
        let beta = std::fs::read_to_string(montage_log_path(dir.path(), "beta")).unwrap();
        let batch = std::fs::read_to_string(montage_log_path(dir.path(), BATCH_LOG)).unwrap();

        assert_eq!(alpha.lines().count(), 2);
        assert!(alpha.contains("solving alpha stage=solve"));
        assert!(alpha.contains("nested alpha"));
        assert!(!alpha.contains("beta"));
        assert_eq!(beta.lines().count(), 1);
        assert!(batch.contains("batch starting"));
        assert!(!batch.contains("alpha"));
    }

    #[tokio::test]
    async fn concurrent_tasks_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber =
            tracing_subscriber::registry().with(MontageLogLayer::new(dir.path()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut set = tokio::task::JoinSet::new();
        for name in ["m1", "m2", "m3"] {
            set.spawn(
                async move {
                    for i in 0..20 {
                        info!("{} line {}", name, i);
                        tokio::task::yield_now().await;
                    }
                }
                .instrument(info_span!("worker", montage = name)),
            );
        }
        while set.join_next().await.is_some() {}

        for name in ["m1", "m2", "m3"] {
            let log = std::fs::read_to_string(montage_log_path(dir.path(), name)).unwrap();
            assert_eq!(log.lines().count(), 20);
            assert!(log.lines().all(|l| l.contains(&format!("{} line", name))));
        }
    }
}
