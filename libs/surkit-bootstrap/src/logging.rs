//! Logging initialization: human-readable console output plus optional
//! rotating JSON files, configured per subsystem (tracing target prefix).

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// Dropping the guard stops the non-blocking console worker.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Parse a configured level. `None` means the sink is switched off.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// True if `target` is `prefix` itself or one of its `prefix::` children.
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file writers =================

#[derive(Clone)]
struct RotatingFile(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl RotatingFile {
    fn open(path: &Path, section: &Section) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let limit = match section.max_backups {
            Some(n) => FileLimit::MaxFiles(n),
            None => FileLimit::Age(chrono::Duration::days(
                i64::from(section.max_age_days.unwrap_or(1)),
            )),
        };
        let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

        Ok(Self(Arc::new(Mutex::new(FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        )))))
    }
}

/// Writer handle that drops writes when no file is routed for a target.
struct RoutedWriter(Option<RotatingFile>);

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file
                .0
                .lock()
                .map_err(|_| std::io::Error::other("log file lock poisoned"))?
                .write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file
                .0
                .lock()
                .map_err(|_| std::io::Error::other("log file lock poisoned"))?
                .flush(),
            None => Ok(()),
        }
    }
}

/// Routes each record to the file of the longest matching subsystem prefix,
/// falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotatingFile>,
    by_prefix: Vec<(String, RotatingFile)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            match RotatingFile::open(&path, section) {
                Ok(file) if name == DEFAULT_SECTION => router.default = Some(file),
                Ok(file) => router.by_prefix.push((name.clone(), file)),
                Err(e) => eprintln!(
                    "Failed to open log file '{}' for '{}': {}",
                    path.display(),
                    name,
                    e
                ),
            }
        }
        // Longest prefix first so nested subsystems win over their parents.
        router.by_prefix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }

    fn resolve(&self, target: &str) -> Option<RotatingFile> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, file)| file.clone())
            .or_else(|| self.default.clone())
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriter(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriter(self.resolve(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

// ================= level targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

fn build_targets(cfg: &LoggingConfig, sink: Sink, has_default_file: bool) -> Targets {
    let level_of = |section: &Section| match sink {
        Sink::Console => parse_level(&section.console_level),
        Sink::File => parse_level(&section.file_level),
    };

    let fallback = match sink {
        Sink::Console => LevelFilter::INFO,
        Sink::File if has_default_file => LevelFilter::INFO,
        Sink::File => LevelFilter::OFF,
    };
    let default_level = cfg
        .get(DEFAULT_SECTION)
        .map(|s| level_of(s).unwrap_or(LevelFilter::OFF))
        .unwrap_or(fallback);

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .filter(|(_, section)| matches!(sink, Sink::Console) || !section.file.trim().is_empty())
        .fold(
            Targets::new().with_default(default_level),
            |targets, (name, section)| {
                targets.with_target(name.clone(), level_of(section).unwrap_or(LevelFilter::OFF))
            },
        )
}

// ================= public init =================

/// Install the global subscriber. Relative log file paths resolve against `base_dir`.
///
/// An empty config installs a minimal console subscriber. `RUST_LOG`, when set,
/// caps every sink.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_targets = build_targets(cfg, Sink::Console, false);
    let file_targets = build_targets(cfg, Sink::File, router.default.is_some());

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().ok())
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// `RUST_LOG` when set, INFO otherwise.
fn minimal_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

fn init_minimal() {
    let _ = tracing_subscriber::registry()
        .with(minimal_filter())
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_age_days: None,
            max_backups: Some(1),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn target_prefix_matching() {
        assert!(matches_target_prefix("surkit", "surkit"));
        assert!(matches_target_prefix("surkit::broker", "surkit"));
        assert!(!matches_target_prefix("surkit_bootstrap", "surkit"));
        assert!(!matches_target_prefix("rest_bridge", "surkit"));
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("off"), None);
        assert_eq!(parse_level("garbage"), Some(LevelFilter::INFO));
    }

    #[test]
    fn router_prefers_longest_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg: LoggingConfig = HashMap::new();
        cfg.insert("default".into(), section("info", "all.log", "debug"));
        cfg.insert("surkit".into(), section("info", "surkit.log", "debug"));
        cfg.insert(
            "surkit::broker".into(),
            section("info", "broker.log", "trace"),
        );

        let router = FileRouter::build(&cfg, dir.path());
        assert!(!router.is_empty());
        assert_eq!(router.by_prefix[0].0, "surkit::broker");
        assert!(router.resolve("rest_bridge::handlers").is_some());

        let broker = router.resolve("surkit::broker::server").unwrap();
        assert!(Arc::ptr_eq(&broker.0, &router.by_prefix[0].1 .0));
    }

    #[test]
    fn sections_without_file_are_skipped_for_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg: LoggingConfig = HashMap::new();
        cfg.insert("surkit".into(), section("debug", "", "debug"));

        let router = FileRouter::build(&cfg, dir.path());
        assert!(router.is_empty());
        assert!(router.resolve("surkit").is_none());
    }

    #[test]
    fn minimal_filter_defaults_to_info() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(minimal_filter().max_level_hint(), Some(LevelFilter::INFO));
    }
}
