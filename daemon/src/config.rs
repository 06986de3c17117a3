use anyhow::{Context, Result};
use common::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root of the shared queue tree. `RQ_DATABASE` takes precedence.
    pub database: Option<PathBuf>,
    /// Display name to register under; defaults to the short hostname.
    pub name: Option<String>,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub comment: String,
    pub ip_address: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_ms: u64,
    #[serde(default)]
    pub stop_after_task: bool,
    #[serde(default = "default_true")]
    pub start_enabled: bool,
    /// Where the registered worker id is kept between runs.
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
}

fn default_pool() -> String { "None".to_string() }
fn default_poll_interval() -> u64 { 5000 }
fn default_poll_jitter() -> u64 { 1000 }
fn default_true() -> bool { true }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: None,
            name: None,
            pool: default_pool(),
            comment: String::new(),
            ip_address: None,
            poll_interval_ms: default_poll_interval(),
            poll_jitter_ms: default_poll_jitter(),
            stop_after_task: false,
            start_enabled: true,
            state_file: None,
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub selection: SelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Queue log; defaults to `<database>/logs/renderqueue.log`.
    pub output: Option<PathBuf>,
    /// Captured render output; defaults to `<database>/logs/tasks.log`.
    pub task_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            task_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus text file rewritten after every task.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let layer = read_layer(path)?;
        if layer.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(layer).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Load the explicit config file if given. Otherwise layer the per-user
    /// config over the system config; either may be missing.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => Self::from_layers(&[
                PathBuf::from(common::DEFAULT_CONFIG_PATH),
                expand_home(common::USER_CONFIG_PATH),
            ]),
        }
    }

    /// Merge the files in order, later ones winning key by key, then fill
    /// whatever none of them set from the defaults. Missing files are
    /// skipped.
    pub fn from_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_yaml::Value::Null;
        for path in paths {
            if !path.is_file() {
                continue;
            }
            merge(&mut merged, read_layer(path)?);
        }
        if merged.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(merged).context("Failed to parse config")
    }

    /// Root of the queue tree: the configured path, or the system path when
    /// running as root and a local directory otherwise.
    pub fn database(&self) -> PathBuf {
        match &self.worker.database {
            Some(path) => expand_home(&path.to_string_lossy()),
            None if nix::unistd::Uid::effective().is_root() => PathBuf::from(common::DEFAULT_DATABASE_PATH),
            None => PathBuf::from(common::USER_DATABASE_PATH),
        }
    }

    /// Worker id state file, defaulting to a per-host file in the database so
    /// a restarted worker keeps its identity.
    pub fn state_file(&self, database: &Path, hostname: &str) -> PathBuf {
        match &self.worker.state_file {
            Some(path) => expand_home(&path.to_string_lossy()),
            None => database
                .join(common::WORKERS_DIR)
                .join(common::HOSTS_DIR)
                .join(format!("{}.id", hostname)),
        }
    }
}

/// Raw contents of one config file, TOML converted to the YAML value model.
fn read_layer(path: &Path) -> Result<serde_yaml::Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path)),
        "toml" => {
            let value: toml::Value = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;
            serde_yaml::to_value(value).with_context(|| format!("Failed to convert config file: {:?}", path))
        }
        _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
    }
}

/// Overlay `other` onto `base`, recursing into sections so a layer only
/// replaces the keys it actually sets.
fn merge(base: &mut serde_yaml::Value, other: serde_yaml::Value) {
    use serde_yaml::Value;
    match (base, other) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.worker.poll_interval_ms, 5000);
        assert!(config.worker.recover_on_start);
        assert!(config.worker.start_enabled);
        assert_eq!(config.worker.pool, "None");
        assert_eq!(config.scheduler.selection, SelectionPolicy::Strict);
        assert_eq!(config.logging.level, "info");
        assert!(config.metrics.file.is_none());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
worker:
  database: /mnt/queue
  name: render01
  pool: lighting
  poll_interval_ms: 2000
  stop_after_task: true
scheduler:
  selection: fallthrough
logging:
  level: debug
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.worker.database, Some(PathBuf::from("/mnt/queue")));
        assert_eq!(config.worker.name.as_deref(), Some("render01"));
        assert_eq!(config.worker.pool, "lighting");
        assert_eq!(config.worker.poll_interval_ms, 2000);
        assert!(config.worker.stop_after_task);
        assert_eq!(config.scheduler.selection, SelectionPolicy::Fallthrough);
        assert_eq!(config.database(), PathBuf::from("/mnt/queue"));
    }

    #[test]
    fn test_toml_file_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[worker]\nname = \"node7\"\n\n[metrics]\nfile = \"/tmp/rq.prom\"").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker.name.as_deref(), Some("node7"));
        assert_eq!(config.metrics.file, Some(PathBuf::from("/tmp/rq.prom")));

        let bad = dir.path().join("worker.ini");
        fs::write(&bad, "").unwrap();
        assert!(Config::from_file(&bad).is_err());
    }

    #[test]
    fn test_user_layer_overrides_only_what_it_sets() {
        let dir = tempfile::TempDir::new().unwrap();
        let system = dir.path().join("system.yaml");
        fs::write(
            &system,
            "worker:\n  database: /mnt/queue\n  pool: lighting\n  poll_interval_ms: 250\n  start_enabled: false\n\
             scheduler:\n  selection: fallthrough\nlogging:\n  level: debug\n",
        )
        .unwrap();
        let user = dir.path().join("user.toml");
        fs::write(&user, "[worker]\nname = \"render02\"\n").unwrap();
        let absent = dir.path().join("absent.yaml");

        let config = Config::from_layers(&[system, absent, user]).unwrap();
        assert_eq!(config.worker.name.as_deref(), Some("render02"));
        assert_eq!(config.worker.database, Some(PathBuf::from("/mnt/queue")));
        assert_eq!(config.worker.pool, "lighting");
        assert_eq!(config.worker.poll_interval_ms, 250);
        assert!(!config.worker.start_enabled);
        assert_eq!(config.scheduler.selection, SelectionPolicy::Fallthrough);
        assert_eq!(config.logging.level, "debug");
        // Unset everywhere, so the default applies.
        assert_eq!(config.worker.poll_jitter_ms, 1000);
    }

    #[test]
    fn test_no_layers_present_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::from_layers(&[dir.path().join("a.yaml"), dir.path().join("b.yaml")]).unwrap();
        assert_eq!(config.worker.poll_interval_ms, 5000);
        assert!(Config::from_file(&dir.path().join("a.yaml")).is_err());
    }

    #[test]
    fn test_default_state_file_lives_in_database() {
        let config = Config::default();
        let path = config.state_file(Path::new("/mnt/queue"), "node7");
        assert_eq!(path, PathBuf::from("/mnt/queue/workers/.hosts/node7.id"));
    }
}
