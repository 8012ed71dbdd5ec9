use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use wakegate::config::Config;
use wakegate::registry::HostRegistry;
use wakegate::remote::TcpPinger;
use wakegate::ssh::SshCommandRunner;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create the registry and bring up the configured hosts
    let runner = Arc::new(SshCommandRunner::new(
        Duration::from_secs(5),
        config.defaults.command_timeout(),
    ));
    let registry = HostRegistry::new(runner, Arc::new(TcpPinger));

    let result = registry.apply_config(&config).await;
    if registry.is_empty() && !config.hosts.is_empty() {
        anyhow::bail!("No host could be started, refusing to run");
    }
    if !result.is_clean() {
        warn!(failed = ?result.failed, "Some hosts failed to start");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match Config::load(&config_path) {
                        Ok(new_config) => {
                            let result = registry.apply_config(&new_config).await;
                            info!(
                                created = ?result.created,
                                updated = ?result.updated,
                                recreated = ?result.recreated,
                                removed = ?result.removed,
                                "Configuration reloaded"
                            );
                            if !result.is_clean() {
                                error!(failed = ?result.failed, "Some hosts failed to start after reload");
                            }
                        }
                        Err(e) => {
                            // Keep running with the previous configuration
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop all hosts: listeners close, in-flight connections drain
    info!("Stopping all hosts...");
    if tokio::time::timeout(Duration::from_secs(10), registry.shutdown())
        .await
        .is_err()
    {
        warn!("Shutdown did not drain within 10s, exiting anyway");
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting wake-on-demand proxy");
    info!(
        wake_timeout_secs = config.defaults.wake_timeout_secs,
        ping_timeout_ms = config.defaults.ping_timeout_ms,
        ping_interval_ms = config.defaults.ping_interval_ms,
        peek_timeout_ms = config.defaults.peek_timeout_ms,
        "Wake settings"
    );
    info!(
        idle_check_interval_secs = config.defaults.idle_check_interval_secs,
        max_alive_secs = config.defaults.max_alive_secs,
        "Idle autostop settings"
    );
    info!(
        host_count = config.hosts.len(),
        hosts = ?config.hosts.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
        "Configured hosts"
    );
}
