//! Configuration loading and parsing.
//!
//! Parses `folio.toml` (or an override path provided by the binary)
//! extracting the watch debounce window, the per-cell evaluation timeout,
//! and the scheduling strategy switch. Missing files and unparseable
//! content fall back to defaults so a broken config never blocks a
//! notebook session. Unknown fields are ignored (TOML deserialization
//! tolerance) to allow forward evolution without immediate warnings.
//!
//! The raw parsed values are retained pre-clamp; `apply_limits` computes
//! the effective values and logs whenever clamping changed something.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

/// Bounds applied to configured values. The debounce floor keeps rapid
/// editor save bursts coalesced; the ceiling keeps the notebook feeling
/// live. The timeout floor protects against configs that would time every
/// cell out before it starts.
pub const DEBOUNCE_MIN_MS: u64 = 20;
pub const DEBOUNCE_MAX_MS: u64 = 5_000;
pub const TIMEOUT_MIN_MS: u64 = 100;

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "WatchConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

impl WatchConfig {
    const fn default_debounce_ms() -> u64 {
        200
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvalConfig {
    #[serde(default = "EvalConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl EvalConfig {
    // Matches the kernel default of 30 seconds.
    const fn default_timeout_ms() -> u64 {
        30_000
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_dependency_tracking")]
    pub dependency_tracking: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            dependency_tracking: Self::default_dependency_tracking(),
        }
    }
}

impl ScheduleConfig {
    const fn default_dependency_tracking() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub eval: EvalConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub raw: Option<String>,        // original file string (optional)
    pub file: ConfigFile,           // parsed (or default) data
    pub effective_debounce: Option<Duration>,
    pub effective_timeout: Option<Duration>,
}

/// Best-effort config path: working directory first, then the platform
/// config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("folio.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("folio").join("folio.toml");
    }
    PathBuf::from("folio.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(Config {
                raw: Some(content),
                file,
                effective_debounce: None, // computed by apply_limits
                effective_timeout: None,
            }),
            Err(e) => {
                warn!(target: "config", file = %path.display(), error = %e, "config_parse_failed_using_defaults");
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}

impl Config {
    /// Clamp raw values into their operating bounds. Returns `self` for
    /// chaining at startup.
    pub fn apply_limits(&mut self) -> &mut Self {
        let raw_debounce = self.file.watch.debounce_ms;
        let clamped_debounce = raw_debounce.clamp(DEBOUNCE_MIN_MS, DEBOUNCE_MAX_MS);
        if clamped_debounce != raw_debounce {
            info!(
                target: "config",
                raw = raw_debounce,
                clamped = clamped_debounce,
                "watch_debounce_clamped"
            );
        }
        self.effective_debounce = Some(Duration::from_millis(clamped_debounce));

        let raw_timeout = self.file.eval.timeout_ms;
        let clamped_timeout = raw_timeout.max(TIMEOUT_MIN_MS);
        if clamped_timeout != raw_timeout {
            info!(
                target: "config",
                raw = raw_timeout,
                clamped = clamped_timeout,
                "eval_timeout_clamped"
            );
        }
        self.effective_timeout = Some(Duration::from_millis(clamped_timeout));
        self
    }

    pub fn debounce(&self) -> Duration {
        self.effective_debounce
            .unwrap_or(Duration::from_millis(WatchConfig::default_debounce_ms()))
    }

    pub fn timeout(&self) -> Duration {
        self.effective_timeout
            .unwrap_or(Duration::from_millis(EvalConfig::default_timeout_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, MutexGuard};
    use tracing::Level;
    use tracing::subscriber::with_default;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferWriter {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl BufferWriter {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let buf = Arc::new(Mutex::new(Vec::new()));
            (Self { inner: buf.clone() }, buf)
        }
    }

    struct LockedWriter<'a> {
        guard: MutexGuard<'a, Vec<u8>>,
    }

    impl<'a> Write for LockedWriter<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = LockedWriter<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            LockedWriter {
                guard: self.inner.lock().expect("log buffer poisoned"),
            }
        }
    }

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_hopefully__.toml"))).unwrap();
        assert_eq!(cfg.file.watch.debounce_ms, 200);
        assert_eq!(cfg.file.eval.timeout_ms, 30_000);
        assert!(cfg.file.schedule.dependency_tracking);
    }

    #[test]
    fn parses_all_sections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[watch]\ndebounce_ms = 350\n[eval]\ntimeout_ms = 5000\n[schedule]\ndependency_tracking = false\n",
        )
        .unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        cfg.apply_limits();
        assert_eq!(cfg.debounce(), Duration::from_millis(350));
        assert_eq!(cfg.timeout(), Duration::from_millis(5000));
        assert!(!cfg.file.schedule.dependency_tracking);
    }

    #[test]
    fn unparseable_config_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[watch\nnot toml").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.watch.debounce_ms, 200);
    }

    #[test]
    fn clamps_debounce_into_bounds() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[watch]\ndebounce_ms = 60000\n").unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        cfg.apply_limits();
        assert_eq!(cfg.debounce(), Duration::from_millis(DEBOUNCE_MAX_MS));

        let tmp2 = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp2.path(), "[watch]\ndebounce_ms = 1\n").unwrap();
        let mut cfg2 = load_from(Some(tmp2.path().to_path_buf())).unwrap();
        cfg2.apply_limits();
        assert_eq!(cfg2.debounce(), Duration::from_millis(DEBOUNCE_MIN_MS));
    }

    #[test]
    fn clamps_timeout_floor() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[eval]\ntimeout_ms = 1\n").unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        cfg.apply_limits();
        assert_eq!(cfg.timeout(), Duration::from_millis(TIMEOUT_MIN_MS));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[watch]\ndebounce_ms = 250\nfuture_knob = true\n[render]\ntheme = \"dark\"\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.watch.debounce_ms, 250);
    }

    #[test]
    fn clamp_logging_uses_config_target() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[watch]\ndebounce_ms = 60000\n").unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        let (writer, buffer) = BufferWriter::new();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_writer(writer)
            .finish();

        with_default(subscriber, || {
            cfg.apply_limits();
        });

        let log_output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(log_output.contains("INFO config:"));
        assert!(log_output.contains("watch_debounce_clamped"));
        assert_eq!(cfg.debounce(), Duration::from_millis(DEBOUNCE_MAX_MS));
    }
}
