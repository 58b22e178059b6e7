use crate::backend::BackendRegistry;
use crate::error::SupervisorError;
use crate::instance::Instance;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Handle to a running backend process. Never serialized.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check; reaps the process if it has exited
    pub fn try_exited(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

/// Starts and stops backend processes.
///
/// Holds no per-instance state: handles are returned to the caller, which
/// decides where to keep them.
pub struct ProcessSupervisor {
    registry: Arc<BackendRegistry>,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Start the backend for `instance` without waiting for it to become ready.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, instance: &Instance) -> Result<ProcessHandle, SupervisorError> {
        let (program, args) = self.registry.command_line(instance)?;

        let spawn_err = |source| SupervisorError::Spawn {
            name: instance.name.clone(),
            program: program.clone(),
            source,
        };

        let path = resolve_program(&program).ok_or_else(|| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("couldn't find the location of {}", program),
            ))
        })?;

        debug!(name = %instance.name, program = %path.display(), ?args, "Spawning backend");

        let mut cmd = Command::new(&path);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = match child_pid(child.id()) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = child.start_kill();
                return Err(spawn_err(e));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            forward_output(instance.name.clone(), instance.port, stderr);
        }

        info!(name = %instance.name, port = instance.port, pid, "Backend process spawned");
        Ok(ProcessHandle { child, pid })
    }

    /// Send SIGTERM and wait until the process is reaped.
    ///
    /// No timeout is applied: a backend that ignores SIGTERM blocks the caller.
    /// On error the handle is still valid and the process may still be running.
    pub async fn terminate(&self, handle: &mut ProcessHandle) -> Result<ExitStatus, SupervisorError> {
        let pid = handle.pid;
        let terminate_err = |source| SupervisorError::Terminate { pid, source };

        if let Some(status) = handle.child.try_wait().map_err(terminate_err)? {
            debug!(pid, ?status, "Backend had already exited");
            return Ok(status);
        }

        info!(pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(terminate_err(std::io::Error::last_os_error()));
            }
        }

        #[cfg(not(unix))]
        {
            handle.child.start_kill().map_err(terminate_err)?;
        }

        let status = handle.child.wait().await.map_err(terminate_err)?;
        info!(pid, ?status, "Backend process exited");
        Ok(status)
    }
}

/// A spawned child without a pid cannot be signalled; 0 would target our
/// own process group
fn child_pid(id: Option<u32>) -> std::io::Result<u32> {
    match id {
        Some(pid) if pid > 0 => Ok(pid),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "spawned process has no pid",
        )),
    }
}

/// Log backend stderr lines until the pipe closes
fn forward_output(name: String, port: u16, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(name = %name, port, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(name = %name, port, error = %e, "Failed to read backend output");
                    break;
                }
            }
        }
    });
}

/// Locate an executable: paths containing a separator are checked as-is,
/// bare names are searched on PATH
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    which::which(program).ok()
}
