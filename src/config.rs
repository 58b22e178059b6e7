use crate::backend::{BackendRegistry, BackendType};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest passphrase the generator will produce
pub const MIN_PASSPHRASE_LENGTH: usize = 8;
/// Longest passphrase the generator can produce without repeating a character
pub const MAX_PASSPHRASE_LENGTH: usize = 52;

/// Unauthenticated control plane paths a secret must not shadow
const RESERVED_PATHS: &[&str] = &["ping", "version"];

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Control plane and state file settings
    pub server: ServerConfig,

    /// Defaults applied to newly created instances
    #[serde(default)]
    pub defaults: InstanceDefaults,

    /// Backend programs, keyed by the name stored in each instance
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Extra plugins, keyed by the plugin id accepted on create
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Control plane listen address, e.g. "0.0.0.0:8080"
    pub bind: String,

    /// Shared secret used as the first path segment of every control request.
    /// If not set, a random secret is generated at startup and logged
    pub secret: Option<String>,

    /// Public hostname written into connection descriptors.
    /// Defaults to the host part of `bind`
    pub hostname: Option<String>,

    /// Path to the JSON state snapshot (must exist at startup)
    pub state_path: PathBuf,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// How often running backends are checked for unexpected exits
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Respawn backends that exited without being deleted (default: true)
    #[serde(default = "default_restart_exited")]
    pub restart_exited: bool,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid control bind address '{}': {}", self.bind, e))
    }

    /// Hostname clients should connect to
    pub fn public_hostname(&self) -> String {
        if let Some(ref hostname) = self.hostname {
            return hostname.clone();
        }
        let host = self
            .bind
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.bind);
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Values used when a create request or a persisted instance omits them
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceDefaults {
    /// Address the backend binds to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Cipher method for instances restored without one
    #[serde(default = "default_method")]
    pub method: String,

    /// Backend program name (default: ssserver)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Plugin id used when a create request has none (default: none)
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Length of generated passphrases (default: 16)
    #[serde(default = "default_passphrase_length")]
    pub passphrase_length: usize,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            method: default_method(),
            backend: default_backend(),
            plugin: default_plugin(),
            passphrase_length: default_passphrase_length(),
        }
    }
}

/// A backend program registration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    /// Argument-construction rule for this program
    #[serde(default)]
    pub kind: BackendType,

    /// Executable path or name looked up on PATH (defaults to the table key)
    pub program: Option<String>,
}

/// A plugin registration: the exact arguments appended to the backend command
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PluginConfig {
    #[serde(default)]
    pub args: Vec<String>,
}

// Default value functions
fn default_monitor_interval() -> u64 {
    10
}

fn default_restart_exited() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_method() -> String {
    "chacha20-ietf-poly1305".to_string()
}

fn default_backend() -> String {
    "ssserver".to_string()
}

fn default_plugin() -> String {
    "none".to_string()
}

fn default_passphrase_length() -> usize {
    16
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }

        if self.server.state_path.as_os_str().is_empty() {
            errors.push("'server.state_path' must not be empty".to_string());
        }

        if let Some(ref secret) = self.server.secret {
            if secret.is_empty() || secret.contains('/') {
                errors.push("'server.secret' must be non-empty and must not contain '/'".to_string());
            }
            if RESERVED_PATHS.contains(&secret.as_str()) {
                errors.push(format!(
                    "'server.secret' must not be '{}', it is a public endpoint",
                    secret
                ));
            }
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("'server.tls_cert' and 'server.tls_key' must be set together".to_string());
        }

        if self.server.monitor_interval_secs == 0 {
            errors.push("'server.monitor_interval_secs' must be greater than 0".to_string());
        }

        let length = self.defaults.passphrase_length;
        if !(MIN_PASSPHRASE_LENGTH..=MAX_PASSPHRASE_LENGTH).contains(&length) {
            errors.push(format!(
                "'defaults.passphrase_length' must be between {} and {}",
                MIN_PASSPHRASE_LENGTH, MAX_PASSPHRASE_LENGTH
            ));
        }

        let registry = BackendRegistry::from_config(self);
        if registry.backend(&self.defaults.backend).is_none() {
            errors.push(format!(
                "'defaults.backend' refers to unknown backend '{}'",
                self.defaults.backend
            ));
        }
        if !registry.has_plugin(&self.defaults.plugin) {
            errors.push(format!(
                "'defaults.plugin' refers to unknown plugin '{}'",
                self.defaults.plugin
            ));
        }

        for name in self.backends.keys() {
            if name.is_empty() {
                errors.push("Backend names must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
