//! Backend programs and plugins
//!
//! Each backend type owns the rule that turns an [`Instance`] into an argument
//! vector. Rules are registered by name in a [`BackendRegistry`]; adding a new
//! proxy implementation means adding a [`BackendKind`] and registering it,
//! not extending a shared format string. Arguments are always passed to the
//! OS as separate strings, so values containing spaces survive intact.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::instance::Instance;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Plugin id meaning "no plugin"
pub const NO_PLUGIN: &str = "none";

/// Argument-construction rule for one family of backend programs
pub trait BackendKind: Send + Sync {
    /// URL scheme of the connection descriptor, e.g. "ss"
    fn scheme(&self) -> &'static str;

    /// Arguments for the instance, not including plugin arguments
    fn build_args(&self, instance: &Instance) -> Vec<String>;
}

/// shadowsocks `ssserver`: `-s addr:port -k passphrase -m method`
pub struct Ssserver;

impl BackendKind for Ssserver {
    fn scheme(&self) -> &'static str {
        "ss"
    }

    fn build_args(&self, instance: &Instance) -> Vec<String> {
        vec![
            "-s".to_string(),
            socket_arg(&instance.bind_address, instance.port),
            "-k".to_string(),
            instance.passphrase.clone(),
            "-m".to_string(),
            instance.cipher_method.clone(),
        ]
    }
}

/// `host:port`, bracketing bare IPv6 addresses
fn socket_arg(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// Backend kinds selectable from the config file
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Ssserver,
}

impl BackendType {
    pub fn rule(&self) -> Arc<dyn BackendKind> {
        match self {
            BackendType::Ssserver => Arc::new(Ssserver),
        }
    }
}

/// A registered backend: which executable to run and how to build its arguments
#[derive(Clone)]
pub struct BackendRule {
    pub program: String,
    pub kind: Arc<dyn BackendKind>,
}

impl std::fmt::Debug for BackendRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRule")
            .field("program", &self.program)
            .field("scheme", &self.kind.scheme())
            .finish()
    }
}

/// Backend rules keyed by backend name, plugin arguments keyed by plugin id
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, BackendRule>,
    plugins: HashMap<String, Vec<String>>,
}

impl BackendRegistry {
    /// `ssserver` plus the `none` and `v2ray` plugins
    pub fn builtin() -> Self {
        let mut registry = Self {
            backends: HashMap::new(),
            plugins: HashMap::new(),
        };
        registry.register_backend("ssserver", "ssserver", Arc::new(Ssserver));
        registry.register_plugin(NO_PLUGIN, Vec::new());
        registry.register_plugin(
            "v2ray",
            ["--plugin", "v2ray-plugin", "--plugin-opts", "server"]
                .map(String::from)
                .to_vec(),
        );
        registry
    }

    /// Built-ins overlaid with the `[backends]` and `[plugins]` tables
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::builtin();
        for (name, backend) in &config.backends {
            let program = backend.program.clone().unwrap_or_else(|| name.clone());
            registry.register_backend(name, &program, backend.kind.rule());
        }
        for (id, plugin) in &config.plugins {
            registry.register_plugin(id, plugin.args.clone());
        }
        registry
    }

    pub fn register_backend(&mut self, name: &str, program: &str, kind: Arc<dyn BackendKind>) {
        self.backends.insert(
            name.to_string(),
            BackendRule {
                program: program.to_string(),
                kind,
            },
        );
    }

    pub fn register_plugin(&mut self, id: &str, args: Vec<String>) {
        self.plugins.insert(id.to_string(), args);
    }

    pub fn backend(&self, name: &str) -> Option<&BackendRule> {
        self.backends.get(name)
    }

    /// An empty id is accepted as "no plugin"
    pub fn has_plugin(&self, id: &str) -> bool {
        id.is_empty() || self.plugins.contains_key(id)
    }

    pub fn plugin_args(&self, id: &str) -> Option<&[String]> {
        if id.is_empty() {
            return Some(&[]);
        }
        self.plugins.get(id).map(Vec::as_slice)
    }

    /// Program and full argument vector for an instance
    pub fn command_line(&self, instance: &Instance) -> Result<(String, Vec<String>), SupervisorError> {
        let not_registered = |what: &str, id: &str| SupervisorError::Spawn {
            name: instance.name.clone(),
            program: instance.backend_program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown {} '{}'", what, id),
            ),
        };

        let rule = self
            .backend(&instance.backend_program)
            .ok_or_else(|| not_registered("backend", &instance.backend_program))?;
        let plugin = self
            .plugin_args(&instance.plugin_id)
            .ok_or_else(|| not_registered("plugin", &instance.plugin_id))?;

        let mut args = rule.kind.build_args(instance);
        args.extend(plugin.iter().cloned());
        Ok((rule.program.clone(), args))
    }

    /// Descriptor scheme for a backend name
    pub fn scheme(&self, backend: &str) -> Option<&'static str> {
        self.backend(backend).map(|rule| rule.kind.scheme())
    }
}
