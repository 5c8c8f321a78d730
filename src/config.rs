use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{GuardError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory every file operation is confined to.  Created lazily on
    /// first write.  Can be overridden with the `SCRATCH_ROOT` env var.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

// -- Fetch -------------------------------------------------------------------

/// Defaults applied when a caller omits a limit, and hard ceilings the
/// caller can never exceed.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_fetch_max_timeout_ms")]
    pub max_timeout_ms: u64,

    #[serde(default = "default_fetch_max_bytes")]
    pub default_max_bytes: usize,

    #[serde(default = "default_fetch_max_bytes_ceiling")]
    pub max_max_bytes: usize,

    #[serde(default = "default_fetch_max_redirects")]
    pub default_max_redirects: u32,

    #[serde(default = "default_fetch_max_redirects_ceiling")]
    pub max_max_redirects: u32,

    #[serde(default = "default_fetch_max_chars")]
    pub default_max_chars: usize,

    #[serde(default = "default_fetch_max_chars_ceiling")]
    pub max_max_chars: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// -- Egress ------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EgressConfig {
    /// Hostnames blocked in addition to the built-in table.  Entries
    /// starting with `*.` block every subdomain.
    #[serde(default)]
    pub extra_blocked_hostnames: Vec<String>,
}

// -- Process -----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Directory holding the vetted scripts `run_script` may execute.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Interpreter binary (default: "python3").
    /// Can be overridden with the `SCRIPT_INTERPRETER` env var.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default = "default_process_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_process_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Cap applied to stdout and stderr independently.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_max_cpu_secs")]
    pub max_cpu_secs: u64,

    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,

    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            fetch: FetchConfig::default(),
            egress: EgressConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_fetch_timeout_ms(),
            max_timeout_ms: default_fetch_max_timeout_ms(),
            default_max_bytes: default_fetch_max_bytes(),
            max_max_bytes: default_fetch_max_bytes_ceiling(),
            default_max_redirects: default_fetch_max_redirects(),
            max_max_redirects: default_fetch_max_redirects_ceiling(),
            default_max_chars: default_fetch_max_chars(),
            max_max_chars: default_fetch_max_chars_ceiling(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            interpreter: default_interpreter(),
            default_timeout_ms: default_process_timeout_ms(),
            max_timeout_ms: default_process_max_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_cpu_secs: default_max_cpu_secs(),
            max_file_size_bytes: default_max_file_size_bytes(),
            max_open_files: default_max_open_files(),
        }
    }
}

impl ProcessConfig {
    /// Clamp a requested timeout to `max_timeout_ms`.
    pub fn timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms.max(1));
        Duration::from_millis(ms)
    }
}

fn default_scratch_root() -> PathBuf {
    Config::data_dir().join("scratch")
}
fn default_scripts_dir() -> PathBuf {
    Config::data_dir().join("scripts")
}
fn default_interpreter() -> String {
    "python3".into()
}
fn default_fetch_timeout_ms() -> u64 {
    15_000
}
fn default_fetch_max_timeout_ms() -> u64 {
    60_000
}
fn default_fetch_max_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_fetch_max_bytes_ceiling() -> usize {
    10 * 1024 * 1024
}
fn default_fetch_max_redirects() -> u32 {
    5
}
fn default_fetch_max_redirects_ceiling() -> u32 {
    10
}
fn default_fetch_max_chars() -> usize {
    50_000
}
fn default_fetch_max_chars_ceiling() -> usize {
    200_000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; scratch-guard/0.1)".into()
}
fn default_process_timeout_ms() -> u64 {
    60_000
}
fn default_process_max_timeout_ms() -> u64 {
    300_000
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_max_cpu_secs() -> u64 {
    600
}
fn default_max_file_size_bytes() -> u64 {
    128 * 1024 * 1024
}
fn default_max_open_files() -> u64 {
    256
}

impl Config {
    /// Load config from the given path, or the default location.  Missing
    /// files fall back to defaults; env overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let mut config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&contents)?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| GuardError::Config(format!("parse error: {e}")))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("SCRATCH_ROOT") {
            if !root.is_empty() {
                self.scratch_root = PathBuf::from(root);
            }
        }
        if let Ok(bin) = std::env::var("SCRIPT_INTERPRETER") {
            if !bin.is_empty() {
                self.process.interpreter = bin;
            }
        }
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/scratch-guard/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("scratch-guard")
            .join("config.toml")
    }

    /// Returns the data directory: `$XDG_DATA_HOME/scratch-guard/`
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("scratch-guard")
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fetch_limits() {
        let f = FetchConfig::default();
        assert_eq!(f.default_timeout_ms, 15_000);
        assert_eq!(f.max_timeout_ms, 60_000);
        assert_eq!(f.default_max_bytes, 2 * 1024 * 1024);
        assert_eq!(f.default_max_redirects, 5);
        assert_eq!(f.max_max_redirects, 10);
        assert_eq!(f.default_max_chars, 50_000);
        assert!(f.default_max_chars <= f.max_max_chars);
        assert!(f.default_max_bytes <= f.max_max_bytes);
    }

    #[test]
    fn default_process_config() {
        let p = ProcessConfig::default();
        assert_eq!(p.interpreter, "python3");
        assert_eq!(p.max_output_bytes, 1024 * 1024);
        assert!(p.scripts_dir.ends_with("scripts"));
    }

    #[test]
    fn process_timeout_is_clamped() {
        let p = ProcessConfig::default();
        assert_eq!(p.timeout(None), Duration::from_millis(60_000));
        assert_eq!(p.timeout(Some(10)), Duration::from_millis(10));
        assert_eq!(p.timeout(Some(10_000_000)), Duration::from_millis(300_000));
        assert_eq!(p.timeout(Some(0)), Duration::from_millis(1));
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
        scratch_root = "/tmp/agent-scratch"

        [fetch]
        max_max_bytes = 4096

        [egress]
        extra_blocked_hostnames = ["intranet.example", "*.corp.example"]

        [process]
        interpreter = "/usr/bin/python3.12"
        max_output_bytes = 2048
        "#;
        let c = Config::from_toml(toml_str).unwrap();
        assert_eq!(c.scratch_root, PathBuf::from("/tmp/agent-scratch"));
        assert_eq!(c.fetch.max_max_bytes, 4096);
        assert_eq!(c.fetch.default_max_redirects, 5);
        assert_eq!(c.egress.extra_blocked_hostnames.len(), 2);
        assert_eq!(c.process.interpreter, "/usr/bin/python3.12");
        assert_eq!(c.process.max_output_bytes, 2048);
        assert_eq!(c.process.default_timeout_ms, 60_000);
    }

    #[test]
    fn parse_error_is_config_error() {
        let err = Config::from_toml("scratch_root = [").unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[test]
    fn default_config_contents_parses() {
        let contents = Config::default_config_contents();
        assert!(!contents.is_empty());
        let c = Config::from_toml(contents).unwrap();
        assert_eq!(c.fetch.default_max_redirects, 5);
        assert_eq!(c.process.interpreter, "python3");
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let c = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(c.fetch.default_timeout_ms, 15_000);
    }
}
