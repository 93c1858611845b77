//! Configuration loading
//!
//! Reads a JSON5 file, layers environment overrides on top and validates
//! the result. The file is located from, in order: an explicit path,
//! `VOCU_TTS_CONFIG_PATH`, then `<config_dir>/vocu-tts/config.json5`.
//! A missing file yields the defaults.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "VOCU_TTS_CONFIG_PATH";
pub const API_KEY_ENV: &str = "VOCU_API_KEY";
pub const PROXY_ENV: &str = "VOCU_PROXY";
pub const BASE_URL_ENV: &str = "VOCU_BASE_URL";
pub const CACHE_DIR_ENV: &str = "VOCU_TTS_CACHE_DIR";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vocu-tts")
        .join("config.json5")
}

/// Pick the config file: explicit path, then the env variable, then the
/// platform default.
pub fn resolve_config_path(explicit: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match env(CONFIG_PATH_ENV) {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}

/// Parse the config file at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if raw.trim().is_empty() {
        return Ok(Config::default());
    }

    json5::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Layer environment overrides onto `config`. Empty values are ignored.
pub fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(key) = get(API_KEY_ENV) {
        config.vocu.api_key = Some(key);
    }
    if let Some(proxy) = get(PROXY_ENV) {
        config.vocu.proxy = Some(proxy);
    }
    if let Some(url) = get(BASE_URL_ENV) {
        config.vocu.base_url = url;
    }
    if let Some(dir) = get(CACHE_DIR_ENV) {
        config.cache.dir = Some(PathBuf::from(dir));
    }
}

/// Resolve, load, override from the process environment, and validate.
/// Returns the config together with the file path it was read from.
pub fn load(explicit: Option<&Path>) -> Result<(Config, PathBuf), ConfigError> {
    let env = |key: &str| std::env::var(key).ok();
    let path = resolve_config_path(explicit, env);
    let mut config = load_config(&path)?;
    apply_env_overrides(&mut config, env);
    config.validate().map_err(ConfigError::Invalid)?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("nope.json5")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.vocu.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.cache.quota_bytes, DEFAULT_QUOTA_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parses_json5_with_partial_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json5");
        std::fs::write(
            &path,
            r#"{
                // comments and trailing commas are fine
                vocu: { apiKey: "sk-test", requestMode: "sync", },
                retry: { maxAttempts: 2 },
                timeouts: { pollIntervalMs: 500 },
                cache: { dir: "/tmp/vocu-cache", quotaBytes: 0 },
                logging: { format: "json" },
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.vocu.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.vocu.request_mode, RequestMode::Sync);
        assert_eq!(config.vocu.default_prompt_id, DEFAULT_PROMPT_ID);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.timeouts.job_limits().poll_interval.as_millis(), 500);
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/vocu-cache"));
        assert_eq!(config.cache.quota_bytes, 0);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_error_names_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json5");
        std::fs::write(&path, "{ vocu: ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json5"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env_of(&[
                (API_KEY_ENV, "sk-env"),
                (PROXY_ENV, "http://127.0.0.1:7890"),
                (BASE_URL_ENV, "http://localhost:9000"),
                (CACHE_DIR_ENV, "/var/cache/vocu"),
            ]),
        );
        assert_eq!(config.vocu.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.vocu.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(config.vocu.base_url, "http://localhost:9000");
        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/vocu"));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.vocu.api_key = Some("from-file".to_string());
        apply_env_overrides(&mut config, env_of(&[(API_KEY_ENV, "  ")]));
        assert_eq!(config.vocu.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_resolve_config_path_precedence() {
        let explicit = PathBuf::from("/etc/vocu.json5");
        let env = env_of(&[(CONFIG_PATH_ENV, "/home/me/vocu.json5")]);
        assert_eq!(resolve_config_path(Some(&explicit), &env), explicit);
        assert_eq!(
            resolve_config_path(None, &env),
            PathBuf::from("/home/me/vocu.json5")
        );
        assert_eq!(resolve_config_path(None, env_of(&[])), default_config_path());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().unwrap_err().contains("maxAttempts"));

        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().unwrap_err().contains("multiplier"));

        let mut config = Config::default();
        config.timeouts.call_timeout_secs = 0;
        assert!(config.validate().unwrap_err().contains("callTimeoutSecs"));

        let mut config = Config::default();
        config.vocu.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_mode_from_str() {
        assert_eq!("SYNC".parse::<RequestMode>().unwrap(), RequestMode::Sync);
        assert_eq!(RequestMode::Async.to_string(), "async");
        assert!("batch".parse::<RequestMode>().is_err());
    }
}
