use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the platform
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Runtime commands used to provision and launch hosted apps
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port carrying console, API and app traffic (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Internal port the admin console listens on; `/console/...` traffic
    /// is proxied there. Unset disables console routing.
    pub console_port: Option<u16>,

    /// Externally visible base URL used to build app links returned by the
    /// API (e.g. "http://my-host:8080"). Falls back to bind:port.
    pub public_base: Option<String>,

    /// Root directory for per-app state (default: ./data)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Lowest internal port handed to hosted apps (default: 8501)
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    /// Highest internal port handed to hosted apps (default: 8999)
    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// Proxy request timeout in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            console_port: None,
            public_base: None,
            data_dir: default_data_dir(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL embedded in app links returned by the API
    pub fn public_base(&self) -> String {
        self.public_base
            .as_deref()
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}:{}", self.bind, self.port))
    }
}

/// Commands driving the external language runtime. Install and launch are
/// opaque to the orchestrator: it only sees exit codes and output.
///
/// Templates may reference `{env}`, `{code}`, `{manifest}`, `{port}` and
/// `{app_id}`; they are substituted and then split with shell-words rules.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Creates the isolated execution environment (run once per app dir)
    #[serde(default = "default_setup_command")]
    pub setup: String,

    /// Installs dependencies from the manifest into the environment
    #[serde(default = "default_install_command")]
    pub install: String,

    /// Launches the app process bound to the assigned port
    #[serde(default = "default_run_command")]
    pub run: String,

    /// Upper bound for a single install command in seconds (default: 1800)
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// How long a freshly launched process must stay alive before it is
    /// considered running, in milliseconds (default: 1500)
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in seconds (default: 10)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Interval for polling a supervised process for exit, in milliseconds
    /// (default: 1000)
    #[serde(default = "default_exit_poll_interval_ms")]
    pub exit_poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            setup: default_setup_command(),
            install: default_install_command(),
            run: default_run_command(),
            install_timeout_secs: default_install_timeout(),
            liveness_window_ms: default_liveness_window_ms(),
            grace_period_secs: default_grace_period(),
            exit_poll_interval_ms: default_exit_poll_interval_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_port_min() -> u16 {
    8501
}

fn default_port_max() -> u16 {
    8999
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_setup_command() -> String {
    "python3 -m venv {env}".to_string()
}

fn default_install_command() -> String {
    "{env}/bin/pip install --disable-pip-version-check -r {manifest}".to_string()
}

fn default_run_command() -> String {
    "{env}/bin/python {code}".to_string()
}

fn default_install_timeout() -> u64 {
    1800
}

fn default_liveness_window_ms() -> u64 {
    1500
}

fn default_grace_period() -> u64 {
    10
}

fn default_exit_poll_interval_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port_min > self.server.port_max {
            anyhow::bail!(
                "port_min ({}) must not exceed port_max ({})",
                self.server.port_min,
                self.server.port_max
            );
        }
        let range = self.server.port_min..=self.server.port_max;
        if range.contains(&self.server.port) {
            anyhow::bail!(
                "public port {} overlaps the internal port pool {}-{}",
                self.server.port,
                self.server.port_min,
                self.server.port_max
            );
        }
        if self.runtime.run.trim().is_empty() {
            anyhow::bail!("runtime.run command must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.port_min, 8501);
        assert_eq!(config.server.port_max, 8999);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert!(config.runtime.setup.contains("venv"));
        assert_eq!(config.runtime.liveness_window(), Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [server]
            port = 9090
            console_port = 8500
            public_base = "http://apps.internal:9090/"
            port_min = 9000
            port_max = 9001

            [runtime]
            run = "sleep 60"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.console_port, Some(8500));
        assert_eq!(config.server.public_base(), "http://apps.internal:9090");
        assert_eq!(config.server.port_min, 9000);
        assert_eq!(config.runtime.run, "sleep 60");
        // install keeps its default
        assert!(config.runtime.install.contains("pip"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_pool() {
        let mut config = Config::default();
        config.server.port_min = 9000;
        config.server.port_max = 8999;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_public_port() {
        let mut config = Config::default();
        config.server.port = 8600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_public_base_fallback() {
        let config = Config::default();
        assert_eq!(config.server.public_base(), "http://0.0.0.0:8080");
    }
}
