//! Configuration types and loading
//!
//! Config path precedence: `--config` > `CONSOLE_CONFIG` env var >
//! `pentest-console.toml`. `CONSOLE_BASE_URL` overrides `api.base_url`.
//! Passwords never live in the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use console_client::{ClientConfig, RetryPolicy, UploadPolicy};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "pentest-console.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            timeout_secs: 120,
        }
    }
}

/// Where the credential is persisted. Memory-only when `path` is absent.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    pub path: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, apply env overrides, validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Configuration without a file: `CONSOLE_BASE_URL` plus defaults.
    pub fn from_env() -> common::Result<Self> {
        let base_url = std::env::var("CONSOLE_BASE_URL").map_err(|_| {
            common::Error::Config(format!(
                "no config file found and CONSOLE_BASE_URL is not set (looked for {DEFAULT_CONFIG_FILE})"
            ))
        })?;
        Config {
            api: ApiConfig {
                base_url,
                timeout_secs: default_timeout(),
            },
            retry: RetryConfig::default(),
            upload: UploadConfig::default(),
            credentials: CredentialsConfig::default(),
        }
        .finish()
    }

    fn finish(mut self) -> common::Result<Self> {
        if let Ok(url) = std::env::var("CONSOLE_BASE_URL") {
            self.api.base_url = url;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "api.base_url",
                format!("must start with http:// or https://, got: {}", self.api.base_url),
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "api.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(common::Error::invalid(
                "retry.max_delay_ms",
                format!(
                    "must be at least retry.initial_delay_ms ({})",
                    self.retry.initial_delay_ms
                ),
            ));
        }
        if self.upload.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "upload.timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONSOLE_CONFIG env var.
    ///
    /// The boolean is false when falling back to the default file name, in
    /// which case a missing file is not an error.
    pub fn resolve_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("CONSOLE_CONFIG") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }

    /// Credential file path with a leading `~/` expanded against `HOME`.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        let path = self.credentials.path.as_ref()?;
        match (path.strip_prefix("~"), std::env::var_os("HOME")) {
            (Ok(rest), Some(home)) => Some(PathBuf::from(home).join(rest)),
            _ => Some(path.clone()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let retry = RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        };
        let mut config = ClientConfig::new(self.api.base_url.clone());
        config.timeout = Duration::from_secs(self.api.timeout_secs);
        config.retry = retry;
        config.upload = UploadPolicy {
            retry: RetryPolicy {
                max_retries: self.upload.max_retries,
                ..retry
            },
            timeout: Duration::from_secs(self.upload.timeout_secs),
            ..UploadPolicy::default()
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// Serializes tests that read or mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn resolve_path_cli_arg() {
        let (path, explicit) = Config::resolve_path(Some(Path::new("/custom/console.toml")));
        assert_eq!(path, PathBuf::from("/custom/console.toml"));
        assert!(explicit);
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONSOLE_CONFIG", "/env/console.toml") };
        let (path, explicit) = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/console.toml"));
        assert!(explicit);
        unsafe { remove_env("CONSOLE_CONFIG") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_CONFIG") };
        let (path, explicit) = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("pentest-console.toml"));
        assert!(!explicit);
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONSOLE_CONFIG", "/env/should-lose.toml") };
        let (path, _) = Config::resolve_path(Some(Path::new("/cli/wins.toml")));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONSOLE_CONFIG"
        );
        unsafe { remove_env("CONSOLE_CONFIG") };
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let file = write_config(
            r#"
[api]
base_url = "https://console.example.com/api/v1"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.upload.max_retries, 1);
        assert!(config.credentials.path.is_none());

        let client = config.client_config();
        assert_eq!(client.timeout, Duration::from_secs(30));
        assert_eq!(client.retry, RetryPolicy::default());
        assert_eq!(client.upload.retry.max_retries, 1);
        assert_eq!(client.upload.timeout, Duration::from_secs(120));
        assert_eq!(client.upload.max_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn full_config_maps_onto_client_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let file = write_config(
            r#"
[api]
base_url = "http://localhost:8000/api/v1"
timeout_secs = 5

[retry]
max_retries = 5
initial_delay_ms = 200
max_delay_ms = 2000

[upload]
max_retries = 0
timeout_secs = 600

[credentials]
path = "/var/lib/pentest-console/credentials.json"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        let client = config.client_config();
        assert_eq!(client.base_url, "http://localhost:8000/api/v1");
        assert_eq!(client.timeout, Duration::from_secs(5));
        assert_eq!(client.retry.max_retries, 5);
        assert_eq!(client.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(client.retry.max_delay, Duration::from_millis(2000));
        assert_eq!(client.upload.retry.max_retries, 0);
        assert_eq!(client.upload.timeout, Duration::from_secs(600));
        assert_eq!(
            config.credentials_path(),
            Some(PathBuf::from("/var/lib/pentest-console/credentials.json"))
        );
    }

    #[test]
    fn base_url_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONSOLE_BASE_URL", "https://staging.example.com/api/v1") };
        let file = write_config(
            r#"
[api]
base_url = "https://console.example.com/api/v1"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.base_url, "https://staging.example.com/api/v1");
        unsafe { remove_env("CONSOLE_BASE_URL") };
    }

    #[test]
    fn from_env_requires_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        assert!(Config::from_env().is_err());

        unsafe { set_env("CONSOLE_BASE_URL", "http://127.0.0.1:8000") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.api.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.api.timeout_secs, 30);
        unsafe { remove_env("CONSOLE_BASE_URL") };
    }

    #[test]
    fn invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let file = write_config(
            r#"
[api]
base_url = "console.example.com"
"#,
        );

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("api.base_url"), "{err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let file = write_config(
            r#"
[api]
base_url = "https://console.example.com"
timeout_secs = 0
"#,
        );

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("api.timeout_secs"), "{err}");
    }

    #[test]
    fn max_delay_below_initial_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let file = write_config(
            r#"
[api]
base_url = "https://console.example.com"

[retry]
initial_delay_ms = 5000
max_delay_ms = 1000
"#,
        );

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("retry.max_delay_ms"), "{err}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/pentest-console.toml")).unwrap_err();
        assert!(matches!(err, common::Error::Io(_)), "{err:?}");
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let file = write_config("[api\nbase_url = ");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, common::Error::Toml(_)), "{err:?}");
    }

    #[test]
    fn credentials_path_expands_home() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONSOLE_BASE_URL") };
        let previous_home = std::env::var("HOME").ok();
        unsafe { set_env("HOME", "/home/analyst") };
        let file = write_config(
            r#"
[api]
base_url = "https://console.example.com"

[credentials]
path = "~/.config/pentest-console/credentials.json"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.credentials_path(),
            Some(PathBuf::from(
                "/home/analyst/.config/pentest-console/credentials.json"
            ))
        );
        match previous_home {
            Some(home) => unsafe { set_env("HOME", &home) },
            None => unsafe { remove_env("HOME") },
        }
    }
}
