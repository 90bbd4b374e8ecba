use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    /// Content roots: the base game and every installed modification.
    #[serde(default)]
    pub roots: Vec<ContentRoot>,
    /// Active sources in load order. Roots not listed here are inactive.
    #[serde(default)]
    pub load_order: Vec<ActiveSource>,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub logging: LogSettings,
    /// External routing table (JSON). The built-in table is used when unset.
    #[serde(default)]
    pub routing: Option<PathBuf>,
    /// External category → merge policy table (JSON).
    #[serde(default)]
    pub policies: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Relative paths resolve against the data directory.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRoot {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub base: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSource {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_parse_timeout_secs")]
    pub parse_timeout_secs: u64,
    /// Claimed items older than this are handed out again.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_max_diagnostics")]
    pub max_diagnostics: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Upper bound on queue items processed per poll tick.
    #[serde(default = "default_items_per_tick")]
    pub items_per_tick: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            parse_timeout_secs: default_parse_timeout_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            max_diagnostics: default_max_diagnostics(),
            max_depth: default_max_depth(),
            items_per_tick: default_items_per_tick(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Log directory. Relative paths resolve against the data directory.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// Filter directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Mirror log lines to stdout as well as the file.
    #[serde(default = "default_enabled")]
    pub stdout: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            rotation: LogRotation::default(),
            stdout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Daily,
    Hourly,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("store.db")
}
fn default_enabled() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_parse_timeout_secs() -> u64 {
    30
}
fn default_stale_claim_secs() -> u64 {
    600
}
fn default_max_diagnostics() -> usize {
    100
}
fn default_max_depth() -> usize {
    256
}

/// Largest accepted `worker.max_depth`. Real content nests a few dozen levels.
pub const MAX_NESTING_DEPTH: usize = 4_096;
fn default_items_per_tick() -> usize {
    64
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("{} is not a valid settings file", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let depth = self.worker.max_depth;
        if depth == 0 || depth > MAX_NESTING_DEPTH {
            anyhow::bail!("worker.max_depth must be between 1 and {MAX_NESTING_DEPTH}, got {depth}");
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Store location, with relative paths taken from `data_dir`.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            data_dir.join(&self.store.path)
        }
    }

    /// Log location, with relative paths taken from `data_dir`.
    pub fn log_dir(&self, data_dir: &Path) -> PathBuf {
        if self.logging.dir.is_absolute() {
            self.logging.dir.clone()
        } else {
            data_dir.join(&self.logging.dir)
        }
    }

    pub fn root(&self, id: &str) -> Option<&ContentRoot> {
        self.roots.iter().find(|r| r.id == id)
    }

    /// Enabled roots in load order. Unknown ids are skipped with a warning.
    pub fn active_roots(&self) -> Vec<&ContentRoot> {
        self.load_order
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| {
                let root = self.root(&s.id);
                if root.is_none() {
                    tracing::warn!(source = %s.id, "load order names an unknown content root");
                }
                root
            })
            .collect()
    }

    pub fn parse_options(&self) -> script_engine::ParseOptions {
        script_engine::ParseOptions {
            parser_version: script_engine::PARSER_VERSION,
            max_diagnostics: self.worker.max_diagnostics,
            max_depth: self.worker.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.store.path, PathBuf::from("store.db"));
        assert_eq!(settings.worker.poll_interval_ms, 500);
        assert_eq!(settings.worker.parse_timeout_secs, 30);
        assert_eq!(settings.worker.stale_claim_secs, 600);
        assert_eq!(settings.worker.max_depth, 256);
        assert!(settings.routing.is_none());
        assert_eq!(settings.logging, LogSettings::default());
    }

    #[test]
    fn test_logging_section() {
        let settings: Settings = serde_json::from_str(
            r#"{"logging": {"dir": "/var/log/modweave", "rotation": "daily", "stdout": false}}"#,
        )
        .unwrap();
        assert_eq!(settings.logging.rotation, LogRotation::Daily);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.stdout);
        assert_eq!(
            settings.log_dir(Path::new("/data")),
            PathBuf::from("/var/log/modweave")
        );
        assert_eq!(Settings::default().log_dir(Path::new("/data")), PathBuf::from("/data/logs"));
    }

    #[test]
    fn test_active_roots_follow_load_order() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "roots": [
                    {"id": "game", "path": "/g", "base": true},
                    {"id": "a", "path": "/a"},
                    {"id": "b", "path": "/b"}
                ],
                "load_order": [
                    {"id": "game"},
                    {"id": "b"},
                    {"id": "a", "enabled": false},
                    {"id": "missing"}
                ]
            }"#,
        )
        .unwrap();
        let ids: Vec<_> = settings.active_roots().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["game", "b"]);
        assert!(settings.root("game").unwrap().base);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");
        let mut settings = Settings::default();
        settings.worker.items_per_tick = 7;
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.worker.items_per_tick, 7);
        assert_eq!(loaded.store_path(dir.path()), dir.path().join("store.db"));
    }

    #[test]
    fn test_load_rejects_unreasonable_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"worker": {"max_depth": 1000000}}"#).unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_depth"), "{err}");

        std::fs::write(&path, r#"{"worker": {"max_depth": 64}}"#).unwrap();
        assert_eq!(Settings::load(&path).unwrap().worker.max_depth, 64);
    }

    #[test]
    fn test_load_reports_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("is not a valid settings file"), "{err}");
    }
}
