//! Configuration types and loading.
//!
//! Config is loaded from a YAML file (default `./config.yaml`, or `CONFIG_FILE`).
//! When a ConfigMap directory is mounted, files named after top-level keys override them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory checked for per-key overrides (one file per top-level key).
pub const DEFAULT_CONFIG_MAP_DIR: &str = "/etc/container-demo-runner";

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for HTTP and WebSocket (default "0.0.0.0").
    #[serde(default = "default_listen_address")]
    pub http_listen_address: String,

    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_listen_port")]
    pub http_listen_port: u16,

    /// Regular expressions; a command runs only if one of them matches its start.
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Extra lines appended to /etc/hosts at startup.
    #[serde(default)]
    pub host_entries: Option<String>,

    /// Where screenshots are written and served from.
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,

    /// Screenshot capture helper, invoked with `--url` and `--screenshot`.
    #[serde(default = "default_screenshot_helper")]
    pub screenshot_helper: PathBuf,

    /// Network probe binary used by performance tests.
    #[serde(default = "default_performance_probe")]
    pub performance_probe: String,

    /// Attempts per measurement before a performance test gives up.
    #[serde(default = "default_max_measurement_attempts")]
    pub max_measurement_attempts: u32,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_screenshot_dir() -> PathBuf {
    std::env::var("PYPPETEER_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/webscreenshots"))
}

fn default_screenshot_helper() -> PathBuf {
    PathBuf::from("./web_screenshot.py")
}

fn default_performance_probe() -> String {
    "sockperf".to_string()
}

fn default_max_measurement_attempts() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen_address: default_listen_address(),
            http_listen_port: default_listen_port(),
            allowed_commands: Vec::new(),
            host_entries: None,
            screenshot_dir: default_screenshot_dir(),
            screenshot_helper: default_screenshot_helper(),
            performance_probe: default_performance_probe(),
            max_measurement_attempts: default_max_measurement_attempts(),
        }
    }
}

impl Config {
    /// Socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_listen_address.trim(), self.http_listen_port)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config.yaml"))
}

/// Resolve the ConfigMap override directory: env CONFIG_MAP_DIR overrides the default.
pub fn config_map_dir() -> PathBuf {
    std::env::var("CONFIG_MAP_DIR")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_MAP_DIR))
}

/// Load config from `path` (or the default path) and apply ConfigMap overrides.
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut raw = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        serde_yaml::Mapping::new()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        match serde_yaml::from_str::<serde_yaml::Value>(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
        {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => anyhow::bail!("config {} must be a mapping", path.display()),
        }
    };
    apply_config_map(&mut raw, &config_map_dir());
    let config = serde_yaml::from_value(serde_yaml::Value::Mapping(raw))
        .with_context(|| format!("parsing config from {}", path.display()))?;
    Ok((config, path))
}

/// Keys whose ConfigMap file holds a number rather than text.
const NUMERIC_KEYS: [&str; 2] = ["http_listen_port", "max_measurement_attempts"];

/// Override keys already present in `raw` with files of the same name under `dir`.
/// List values are read as JSON, numeric keys as integers; anything else takes the
/// trimmed file contents verbatim.
pub fn apply_config_map(raw: &mut serde_yaml::Mapping, dir: &Path) {
    if !dir.is_dir() {
        return;
    }
    let keys: Vec<String> = raw
        .keys()
        .filter_map(|k| k.as_str().map(String::from))
        .collect();
    for key in keys {
        let file = dir.join(&key);
        if !file.exists() {
            continue;
        }
        let contents = match std::fs::read_to_string(&file) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("error reading {} from ConfigMap: {}", key, e);
                continue;
            }
        };
        let slot = serde_yaml::Value::String(key.clone());
        let new_value = if raw.get(&slot).map_or(false, |v| v.is_sequence()) {
            match serde_json::from_str::<serde_json::Value>(&contents)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_yaml::to_value(v).map_err(|e| e.to_string()))
            {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("error reading {} from ConfigMap: {}", key, e);
                    continue;
                }
            }
        } else if NUMERIC_KEYS.contains(&key.as_str()) {
            match contents.trim().parse::<u64>() {
                Ok(n) => serde_yaml::Value::Number(n.into()),
                Err(e) => {
                    log::warn!("error reading {} from ConfigMap: {}", key, e);
                    continue;
                }
            }
        } else {
            serde_yaml::Value::String(contents.trim().to_string())
        };
        log::info!("loading config setting: {} from ConfigMap", key);
        raw.insert(slot, new_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_keys_absent() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.http_listen_port, 8080);
        assert_eq!(config.http_listen_address, "0.0.0.0");
        assert!(config.allowed_commands.is_empty());
        assert_eq!(config.max_measurement_attempts, 5);
        assert_eq!(config.performance_probe, "sockperf");
    }

    #[test]
    fn parses_original_keys() {
        let yaml = "http_listen_address: 127.0.0.1\nhttp_listen_port: 5000\nallowed_commands:\n  - ^echo\n  - ^ls\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:5000");
        assert_eq!(config.allowed_commands, vec!["^echo", "^ls"]);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, path) = load_config(Some(dir.path().join("nope.yaml"))).unwrap();
        assert_eq!(config.http_listen_port, 8080);
        assert!(path.ends_with("nope.yaml"));
    }

    #[test]
    fn config_map_overrides_present_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("allowed_commands"), r#"["^uname", "^id"]"#).unwrap();
        std::fs::write(dir.path().join("http_listen_port"), "9090\n").unwrap();
        std::fs::write(dir.path().join("host_entries"), "10.0.0.1 db\n").unwrap();

        let mut raw: serde_yaml::Mapping =
            serde_yaml::from_str("allowed_commands: ['^echo']\nhttp_listen_port: 8080\n").unwrap();
        apply_config_map(&mut raw, dir.path());
        let config: Config = serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).unwrap();

        assert_eq!(config.allowed_commands, vec!["^uname", "^id"]);
        assert_eq!(config.http_listen_port, 9090);
        // only keys present in the file are overridden
        assert!(config.host_entries.is_none());
    }

    #[test]
    fn config_map_text_values_are_kept_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("host_entries"), "10.0.0.1 db\n10.0.0.2 web # primary\n").unwrap();
        std::fs::write(dir.path().join("performance_probe"), "/opt/bin/sockperf\n").unwrap();
        std::fs::write(dir.path().join("max_measurement_attempts"), " 3\n").unwrap();

        let mut raw: serde_yaml::Mapping = serde_yaml::from_str(
            "host_entries: '10.9.9.9 old'\nperformance_probe: sockperf\nmax_measurement_attempts: 5\n",
        )
        .unwrap();
        apply_config_map(&mut raw, dir.path());
        let config: Config = serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).unwrap();

        assert_eq!(
            config.host_entries.as_deref(),
            Some("10.0.0.1 db\n10.0.0.2 web # primary")
        );
        assert_eq!(config.performance_probe, "/opt/bin/sockperf");
        assert_eq!(config.max_measurement_attempts, 3);
    }

    #[test]
    fn config_map_bad_number_keeps_file_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("http_listen_port"), "eighty").unwrap();
        let mut raw: serde_yaml::Mapping = serde_yaml::from_str("http_listen_port: 5000").unwrap();
        apply_config_map(&mut raw, dir.path());
        let config: Config = serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).unwrap();
        assert_eq!(config.http_listen_port, 5000);
    }

    #[test]
    fn config_map_bad_json_keeps_file_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("allowed_commands"), "not json").unwrap();
        let mut raw: serde_yaml::Mapping = serde_yaml::from_str("allowed_commands: ['^echo']").unwrap();
        apply_config_map(&mut raw, dir.path());
        let config: Config = serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).unwrap();
        assert_eq!(config.allowed_commands, vec!["^echo"]);
    }
}
