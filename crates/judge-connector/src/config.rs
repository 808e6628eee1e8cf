use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "JUDGE_CONNECTOR_CONFIG";
const APP_DIR: &str = "judge-connector";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_true")]
    pub tmpfs: bool,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Command used to reach the external execution engine.
#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            args: Vec::new(),
        }
    }
}

/// One dispatcher this connector serves.
#[derive(Deserialize, Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub server_url: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default = "default_true")]
    pub detail: bool,
    #[serde(default)]
    pub min_priority: Option<i32>,
    #[serde(default)]
    pub no_status: bool,
}

impl Config {
    /// Load from an explicit path, `$JUDGE_CONNECTOR_CONFIG`, or the XDG
    /// config location, in that order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(config_path),
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        for host in &mut config.hosts {
            host.server_url = normalize_server_url(&host.server_url);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("at least one [[hosts]] entry is required");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.host.is_empty()
                || host.host == "."
                || host.host == ".."
                || host.host.contains('/')
            {
                bail!("host name '{}' cannot be used as a directory name", host.host);
            }
            if !seen.insert(host.host.as_str()) {
                bail!("duplicate host name '{}'", host.host);
            }
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

/// Ensure a scheme and a trailing slash so relative endpoints join cleanly.
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if !url.starts_with("http") {
        url = format!("http://{url}");
    }
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Default config file location.
pub fn config_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join(APP_DIR).join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml")
    } else {
        PathBuf::from("/etc").join(APP_DIR).join("config.toml")
    }
}

fn default_cache_dir() -> PathBuf {
    if let Ok(cache_dir) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(cache_dir).join(APP_DIR)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache").join(APP_DIR)
    } else {
        PathBuf::from("/var/cache").join(APP_DIR)
    }
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join(APP_DIR)
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_queue_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_tmpfs_size() -> String {
    "512m".to_string()
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_status_interval_secs() -> u64 {
    1200
}

fn default_keepalive_interval_secs() -> u64 {
    30_000
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("judge-engine")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[hosts]]
        host = "main"
        server_url = "oj.example.com"
        uname = "judge"
        password = "secret"
    "#;

    #[test]
    fn defaults_are_applied() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert!(config.tmpfs);
        assert_eq!(config.tmpfs_size, "512m");
        assert_eq!(config.retry_delay(), Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 64);
        assert!(config.concurrency >= 1);

        let host = &config.hosts[0];
        assert_eq!(host.server_url, "http://oj.example.com/");
        assert!(host.detail);
        assert!(host.min_priority.is_none());
        assert!(!host.no_status);
    }

    #[test]
    fn server_url_keeps_existing_scheme() {
        assert_eq!(normalize_server_url("https://a.b/"), "https://a.b/");
        assert_eq!(normalize_server_url("http://a.b"), "http://a.b/");
    }

    #[test]
    fn rejects_missing_hosts() {
        let err = Config::from_toml("concurrency = 2").unwrap_err();
        assert!(err.to_string().contains("[[hosts]]"));
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let raw = format!("{MINIMAL}\n{MINIMAL}");
        let err = Config::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate host"));
    }

    #[test]
    fn rejects_path_like_host_names() {
        let raw = r#"
            [[hosts]]
            host = "../etc"
            server_url = "http://x/"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn engine_command_is_configurable() {
        let raw = format!(
            "{MINIMAL}\n[engine]\nprogram = \"/opt/engine/bin/run\"\nargs = [\"--sandbox\", \"strict\"]\n"
        );
        let config = Config::from_toml(&raw).unwrap();
        assert_eq!(config.engine.program, PathBuf::from("/opt/engine/bin/run"));
        assert_eq!(config.engine.args, vec!["--sandbox", "strict"]);
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.hosts[0].host, "main");

        let missing = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(missing.to_string().contains("failed to read config"));
    }
}
