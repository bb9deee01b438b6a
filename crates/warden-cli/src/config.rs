//! Configuration Vault – reads/writes `~/.warden/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use warden_runtime::RuntimeConfig;

/// Persisted operator configuration stored in `~/.warden/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of an OpenAI-compatible server (Ollama, vLLM, OpenAI, ...).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer token (stored as plain text; the file is created 0600).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// Client-side request limit; 0 disables it.
    #[serde(default)]
    pub requests_per_minute: u32,

    /// SQLite file holding tasks, steps and long-term memory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("requests_per_minute", &self.requests_per_minute)
            .field("db_path", &self.db_path)
            .field("runtime", &self.runtime)
            .finish()
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_db_path() -> PathBuf {
    warden_dir(&home()).join("warden.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: String::new(),
            requests_per_minute: 0,
            db_path: default_db_path(),
            runtime: RuntimeConfig::default(),
        }
    }
}

fn home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn warden_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".warden")
}

/// Return the path to `~/.warden/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    warden_dir(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config file if there is one, defaults otherwise. Environment
/// overrides apply in both cases.
pub fn load_or_default() -> Result<Config, String> {
    let mut cfg = load()?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `WARDEN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `WARDEN_BASE_URL` | `base_url` |
/// | `WARDEN_MODEL` | `model` |
/// | `WARDEN_API_KEY` | `api_key` |
/// | `WARDEN_DB_PATH` | `db_path` |
/// | `WARDEN_OUTPUT_DIR` | `runtime.firewall.output_dir` |
/// | `WARDEN_MAX_STEPS` | `runtime.max_steps` (ignored unless a number) |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("WARDEN_BASE_URL") {
        cfg.base_url = v;
    }
    if let Ok(v) = std::env::var("WARDEN_MODEL") {
        cfg.model = v;
    }
    if let Ok(v) = std::env::var("WARDEN_API_KEY") {
        cfg.api_key = v;
    }
    if let Ok(v) = std::env::var("WARDEN_DB_PATH") {
        cfg.db_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("WARDEN_OUTPUT_DIR") {
        cfg.runtime.firewall.output_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("WARDEN_MAX_STEPS")
        && let Ok(steps) = v.trim().parse::<u32>()
    {
        cfg.runtime.max_steps = steps;
    }
}

/// Save the config to disk, creating `~/.warden/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let cfg = Config {
            api_key: "sk-super-secret".to_string(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_key() {
        assert!(format!("{:?}", Config::default()).contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_runtime_settings() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.runtime.max_steps = 12;
        cfg.runtime.firewall.output_dir = PathBuf::from("/srv/agent-out");
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.model, "llama3");
        assert_eq!(loaded.runtime, cfg.runtime);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = \"qwen2\"\n[runtime]\nmax_steps = 7\n").unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.model, "qwen2");
        assert_eq!(loaded.base_url, "http://localhost:11434");
        assert_eq!(loaded.runtime.max_steps, 7);
        assert_eq!(loaded.runtime.reflection_interval, 5);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_steps = [").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_warden_dir() {
        let p = config_path_for_home("/home/operator");
        assert_eq!(p, PathBuf::from("/home/operator/.warden/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn env_overrides_base_url_and_model() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("WARDEN_BASE_URL", "http://gpu-box:8000");
            std::env::set_var("WARDEN_MODEL", "qwen2.5-coder");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.base_url, "http://gpu-box:8000");
        assert_eq!(cfg.model, "qwen2.5-coder");
        unsafe {
            std::env::remove_var("WARDEN_BASE_URL");
            std::env::remove_var("WARDEN_MODEL");
        }
    }

    #[test]
    fn env_overrides_output_dir() {
        // SAFETY: this variable is only touched by this test.
        unsafe { std::env::set_var("WARDEN_OUTPUT_DIR", "/tmp/warden-out") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.runtime.firewall.output_dir, PathBuf::from("/tmp/warden-out"));
        unsafe { std::env::remove_var("WARDEN_OUTPUT_DIR") };
    }

    #[test]
    fn env_max_steps_ignores_non_numbers() {
        // SAFETY: this variable is only touched by this test.
        unsafe { std::env::set_var("WARDEN_MAX_STEPS", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.runtime.max_steps, 50);

        unsafe { std::env::set_var("WARDEN_MAX_STEPS", "120") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.runtime.max_steps, 120);
        unsafe { std::env::remove_var("WARDEN_MAX_STEPS") };
    }
}
