use crate::backend::BackendRegistry;
use crate::config::{Config, InstanceDefaults};
use crate::error::SupervisorError;
use crate::instance::{generate_passphrase, Instance, InstanceState};
use crate::process::{ProcessHandle, ProcessSupervisor};
use crate::state::{self, Snapshot};
use crate::table::PortTable;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest accepted instance name
const MAX_NAME_LENGTH: usize = 128;

/// Fields of a create request as received from the control plane
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub method: Option<String>,
    pub plugin: Option<String>,
}

/// Status information for an occupied port (no passphrase)
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub port: u16,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub method: String,
    pub backend: String,
    pub plugin: String,
}

/// Outcome of restoring persisted instances at startup
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    pub started: usize,
    /// Names whose spawn failed; their ports were released
    pub failed: Vec<String>,
}

/// Owns the port table and the live process of every instance.
///
/// # Locking
///
/// The port table sits behind one `RwLock`. Every check-then-commit sequence
/// (name check + port allocation + occupy on create, lookup + mark
/// terminating on delete) happens inside a single write guard. Spawning and
/// terminating processes happen with no table lock held; the slot state
/// (`provisioning`, `terminating`) keeps other requests off the port
/// meanwhile. When both are needed, the table lock is taken before any
/// `handles` entry.
///
/// `Supervisor` is designed to be shared behind an `Arc`; [`new`](Supervisor::new)
/// returns `Arc<Self>` directly.
pub struct Supervisor {
    table: RwLock<PortTable>,
    /// Live process handles keyed by port
    handles: DashMap<u16, ProcessHandle>,
    processes: ProcessSupervisor,
    defaults: InstanceDefaults,
    hostname: String,
    state_path: PathBuf,
    restart_exited: bool,
    /// Serializes snapshot writes so an older snapshot never lands last
    save_lock: tokio::sync::Mutex<()>,
    /// Set by `stop_all`; no backend is spawned afterwards
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// Build a supervisor from configuration and a loaded snapshot.
    ///
    /// Records without a method or backend get the configured defaults.
    /// Persisted instances are placed in the table as running but no process
    /// is started; call [`start_all`](Supervisor::start_all) for that.
    pub fn new(config: &Config, snapshot: &Snapshot) -> Result<Arc<Self>, SupervisorError> {
        let mut snapshot = snapshot.clone();
        for instance in &mut snapshot.state {
            if instance.cipher_method.is_empty() {
                instance.cipher_method = config.defaults.method.clone();
            }
            if instance.backend_program.is_empty() {
                instance.backend_program = config.defaults.backend.clone();
            }
        }

        let table = PortTable::from_snapshot(&snapshot)?;
        let registry = Arc::new(BackendRegistry::from_config(config));

        Ok(Arc::new(Self {
            table: RwLock::new(table),
            handles: DashMap::new(),
            processes: ProcessSupervisor::new(registry),
            defaults: config.defaults.clone(),
            hostname: config.server.public_hostname(),
            state_path: config.server.state_path.clone(),
            restart_exited: config.server.restart_exited,
            save_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// Load the snapshot, populate the table and start every persisted
    /// instance. Returns once every spawn attempt has finished.
    pub async fn bootstrap(config: &Config) -> Result<Arc<Self>, SupervisorError> {
        let path = &config.server.state_path;
        let snapshot = state::load(path)?;
        info!(
            path = %path.display(),
            range_min = snapshot.range_min(),
            range_max = snapshot.range_max(),
            instances = snapshot.state.len(),
            "State loaded"
        );

        let supervisor = Self::new(config, &snapshot)?;
        let report = supervisor.start_all().await;
        info!(
            started = report.started,
            failed = report.failed.len(),
            "Persisted instances restored"
        );
        Ok(supervisor)
    }

    /// Spawn all running instances that have no process, in parallel.
    ///
    /// A failure only affects its own instance: it is logged and the port is
    /// released so the name can be created again.
    pub async fn start_all(self: &Arc<Self>) -> StartReport {
        let pending: Vec<Instance> = {
            let table = self.table.read();
            table
                .occupied()
                .filter(|slot| slot.state == InstanceState::Running)
                .filter(|slot| !self.handles.contains_key(&slot.instance.port))
                .map(|slot| slot.instance.clone())
                .collect()
        };

        let tasks = pending.into_iter().map(|instance| {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                let result = supervisor.processes.spawn(&instance);
                (instance, result)
            })
        });

        let mut report = StartReport::default();
        for joined in join_all(tasks).await {
            match joined {
                Ok((instance, Ok(handle))) => {
                    self.handles.insert(instance.port, handle);
                    report.started += 1;
                }
                Ok((instance, Err(e))) => {
                    warn!(
                        name = %instance.name,
                        port = instance.port,
                        error = %e,
                        "Failed to spawn persisted instance, releasing its port"
                    );
                    self.table.write().release(instance.port);
                    report.failed.push(instance.name);
                }
                Err(e) => {
                    error!(error = %e, "Startup spawn task failed");
                }
            }
        }

        report
    }

    /// Provision a new instance: reserve a port, spawn its backend, persist.
    pub async fn create(&self, request: CreateRequest) -> Result<Instance, SupervisorError> {
        let name = request.name.trim();
        validate_name(name)?;

        let method = request
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| SupervisorError::Validation("method is empty".to_string()))?;
        validate_method(method)?;

        let plugin = request
            .plugin
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(self.defaults.plugin.as_str());
        if !self.processes.registry().has_plugin(plugin) {
            return Err(SupervisorError::Validation(format!(
                "unknown plugin '{}'",
                plugin
            )));
        }

        let draft = Instance {
            name: name.to_string(),
            port: 0,
            passphrase: generate_passphrase(self.defaults.passphrase_length),
            bind_address: self.defaults.bind_address.clone(),
            cipher_method: method.to_string(),
            backend_program: self.defaults.backend.clone(),
            plugin_id: plugin.to_string(),
        };

        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let port = self.table.write().reserve(draft.clone())?;
        let instance = Instance { port, ..draft };
        debug!(name = %instance.name, port, "Port reserved");

        let handle = match self.processes.spawn(&instance) {
            Ok(handle) => handle,
            Err(e) => {
                self.table.write().release(port);
                error!(name = %instance.name, port, error = %e, "Failed to spawn backend, port released");
                return Err(e);
            }
        };
        let pid = handle.pid();
        self.handles.insert(port, handle);

        // stop_all may have collected the handles before this one was inserted
        if self.is_shutting_down() {
            if let Some((_, mut handle)) = self.handles.remove_if(&port, |_, h| h.pid() == pid) {
                if let Err(e) = self.processes.terminate(&mut handle).await {
                    error!(name = %instance.name, port, error = %e, "Failed to stop backend spawned during shutdown");
                }
            }
            self.table.write().release(port);
            return Err(SupervisorError::ShuttingDown);
        }

        self.table.write().set_state(port, InstanceState::Running);

        info!(
            name = %instance.name,
            port,
            method = %instance.cipher_method,
            plugin = %instance.plugin_id,
            "Instance created"
        );

        if let Err(e) = self.persist().await {
            error!(
                name = %instance.name,
                port,
                error = %e,
                "Instance is running but could not be persisted"
            );
        }

        Ok(instance)
    }

    /// Connection descriptor for a running instance
    pub fn inspect(&self, name: &str) -> Result<String, SupervisorError> {
        let instance = self
            .table
            .read()
            .running_by_name(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let scheme = self
            .processes
            .registry()
            .scheme(&instance.backend_program)
            .ok_or_else(|| {
                SupervisorError::Internal(format!(
                    "instance '{}' refers to unknown backend '{}'",
                    instance.name, instance.backend_program
                ))
            })?;

        Ok(instance.connect_url(scheme, &self.hostname))
    }

    /// Stop an instance's backend, free its port and persist.
    ///
    /// If the backend cannot be terminated the instance stays running and
    /// keeps its port.
    pub async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        let instance = self.table.write().begin_removal(name)?;
        let port = instance.port;
        info!(name, port, "Stopping instance");

        if let Some((_, mut handle)) = self.handles.remove(&port) {
            if let Err(e) = self.processes.terminate(&mut handle).await {
                error!(
                    name,
                    port,
                    pid = handle.pid(),
                    error = %e,
                    "Failed to terminate backend, keeping port occupied"
                );
                self.handles.insert(port, handle);
                self.table.write().set_state(port, InstanceState::Running);
                return Err(e);
            }
        } else {
            debug!(name, port, "Instance has no live process");
        }

        self.table.write().release(port);
        info!(name, port, "Instance removed");

        if let Err(e) = self.persist().await {
            error!(name, port, error = %e, "Instance removed but state could not be persisted");
        }

        Ok(())
    }

    /// Every occupied port in port order
    pub fn list(&self) -> Vec<InstanceStatus> {
        let table = self.table.read();
        table
            .occupied()
            .map(|slot| InstanceStatus {
                name: slot.instance.name.clone(),
                port: slot.instance.port,
                state: slot.state,
                pid: self.handles.get(&slot.instance.port).map(|h| h.pid()),
                method: slot.instance.cipher_method.clone(),
                backend: slot.instance.backend_program.clone(),
                plugin: slot.instance.plugin_id.clone(),
            })
            .collect()
    }

    /// Write the current table to the state file
    pub async fn persist(&self) -> Result<(), SupervisorError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.table.read().snapshot();
        let path = self.state_path.clone();

        tokio::task::spawn_blocking(move || state::save(&path, &snapshot))
            .await
            .map_err(|e| SupervisorError::Io {
                path: self.state_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
    }

    /// Reap backends that exited on their own and, if configured, respawn them.
    ///
    /// Returns the number of exited backends found.
    pub async fn check_exited(&self) -> usize {
        let mut exited = Vec::new();
        for mut entry in self.handles.iter_mut() {
            let port = *entry.key();
            let handle = entry.value_mut();
            match handle.try_exited() {
                Ok(Some(status)) => exited.push((port, handle.pid(), status)),
                Ok(None) => {}
                Err(e) => warn!(port, pid = handle.pid(), error = %e, "Failed to poll backend"),
            }
        }

        for (port, pid, status) in &exited {
            // A concurrent delete/create may have replaced the handle already
            if self.handles.remove_if(port, |_, h| h.pid() == *pid).is_some() {
                warn!(port, pid, ?status, "Backend exited unexpectedly");
            }
        }

        if self.restart_exited {
            self.restart_missing().await;
        }

        exited.len()
    }

    /// Respawn running instances that have no live process
    async fn restart_missing(&self) {
        let missing: Vec<Instance> = {
            let table = self.table.read();
            table
                .occupied()
                .filter(|slot| slot.state == InstanceState::Running)
                .filter(|slot| !self.handles.contains_key(&slot.instance.port))
                .map(|slot| slot.instance.clone())
                .collect()
        };

        for instance in missing {
            if self.is_shutting_down() {
                break;
            }

            let port = instance.port;
            let handle = match self.processes.spawn(&instance) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(name = %instance.name, port, error = %e, "Failed to restart backend, will retry");
                    continue;
                }
            };

            let pid = handle.pid();

            // The instance may have been deleted (or replaced) while spawning
            let mut orphan = {
                let table = self.table.write();
                let unchanged = table.get(port).is_some_and(|slot| {
                    slot.instance.name == instance.name && slot.state == InstanceState::Running
                });
                if unchanged && !self.handles.contains_key(&port) {
                    self.handles.insert(port, handle);
                    None
                } else {
                    Some(handle)
                }
            };

            if orphan.is_none() && self.is_shutting_down() {
                orphan = self
                    .handles
                    .remove_if(&port, |_, h| h.pid() == pid)
                    .map(|(_, handle)| handle);
            }

            match orphan {
                None => info!(name = %instance.name, port, "Backend restarted"),
                Some(mut handle) => {
                    debug!(name = %instance.name, port, "Restarted backend no longer needed, stopping it");
                    if let Err(e) = self.processes.terminate(&mut handle).await {
                        error!(name = %instance.name, port, error = %e, "Failed to stop orphaned backend");
                    }
                }
            }
        }
    }

    /// Terminate every backend without touching the table or the state file,
    /// so the same instances are restored on the next start
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let ports: Vec<u16> = self.handles.iter().map(|entry| *entry.key()).collect();
        let handles: Vec<(u16, ProcessHandle)> = ports
            .into_iter()
            .filter_map(|port| self.handles.remove(&port))
            .collect();

        let stops = handles.into_iter().map(|(port, mut handle)| async move {
            let result = self.processes.terminate(&mut handle).await;
            (port, result)
        });

        for (port, result) in join_all(stops).await {
            if let Err(e) = result {
                error!(port, error = %e, "Failed to stop backend");
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Durable view of the table
    pub fn snapshot(&self) -> Snapshot {
        self.table.read().snapshot()
    }

    pub fn free_ports(&self) -> usize {
        self.table.read().free_count()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

fn validate_name(name: &str) -> Result<(), SupervisorError> {
    if name.is_empty() {
        return Err(SupervisorError::Validation("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(SupervisorError::Validation(format!(
            "name is longer than {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    if name.contains('/') || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SupervisorError::Validation(
            "name must not contain '/', whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_method(method: &str) -> Result<(), SupervisorError> {
    if method
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(SupervisorError::Validation(format!(
            "invalid method '{}'",
            method
        )))
    }
}
