use portwarden::config::Config;
use portwarden::control::{ControlServer, PKG_NAME, VERSION};
use portwarden::supervisor::Supervisor;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portwarden=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("portwarden.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let bind_addr = config.server.bind_addr()?;

    let tls_acceptor = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled for the control plane");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        _ => None,
    };

    // Restore persisted instances before accepting requests
    let supervisor = Supervisor::bootstrap(&config).await.map_err(|e| {
        error!(path = %config.server.state_path.display(), error = %e, "Failed to load state");
        anyhow::anyhow!(e)
    })?;

    // Generate or use configured secret
    let secret = config.server.secret.clone().unwrap_or_else(|| {
        let secret = uuid::Uuid::new_v4().to_string();
        info!(secret = %secret, "Generated control plane secret (configure server.secret to set a fixed value)");
        secret
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut control_server = ControlServer::new(bind_addr, Arc::clone(&supervisor), shutdown_rx.clone(), secret);
    if let Some(acceptor) = tls_acceptor {
        control_server = control_server.with_tls(acceptor);
    }

    // Spawn crash monitor
    let monitor_supervisor = Arc::clone(&supervisor);
    let monitor_shutdown_rx = shutdown_rx.clone();
    let monitor_interval = config.server.monitor_interval();
    let monitor_handle = tokio::spawn(async move {
        monitor_loop(monitor_supervisor, monitor_interval, monitor_shutdown_rx).await;
    });

    // Spawn control plane
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control plane error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and let the monitor finish its tick so nothing respawns
    let _ = shutdown_tx.send(true);
    let _ = monitor_handle.await;

    // Backends are stopped but stay in the state file for the next start
    info!("Stopping all backends...");
    supervisor.stop_all().await;

    // Wait for the control plane to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn monitor_loop(supervisor: Arc<Supervisor>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                supervisor.check_exited().await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another supervisor is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.server.bind,
        hostname = %config.server.public_hostname(),
        tls = config.server.tls_enabled(),
        state_path = %config.server.state_path.display(),
        "Server configuration"
    );
    info!(
        monitor_interval_secs = config.server.monitor_interval_secs,
        restart_exited = config.server.restart_exited,
        "Crash monitor settings"
    );
    info!(
        bind_address = %config.defaults.bind_address,
        backend = %config.defaults.backend,
        plugin = %config.defaults.plugin,
        passphrase_length = config.defaults.passphrase_length,
        "Instance defaults"
    );
    info!(
        backends = ?config.backends.keys().collect::<Vec<_>>(),
        plugins = ?config.plugins.keys().collect::<Vec<_>>(),
        "Registered backends and plugins"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}
