//! Injected collaborators for remote control and liveness probing.
//!
//! `HostController` never talks to the network directly for start/stop or
//! reachability; it goes through these traits so tests can swap in mocks.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::HostConfig;

/// Runs an OS-level command on the target host (or its hypervisor).
///
/// Treated as a black box with a timeout; the production implementation is
/// [`SshCommandRunner`](crate::ssh::SshCommandRunner).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_remote_command(&self, host: &HostConfig, command: &str) -> anyhow::Result<()>;
}

/// Reachability probe against a host address.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Returns whether the host answered within `timeout`.
    async fn ping(&self, host: &HostConfig, timeout: Duration) -> anyhow::Result<bool>;
}

/// Liveness probe that attempts a TCP connection to the host's SSH port.
///
/// ICMP would need a raw socket and elevated privileges; a successful TCP
/// handshake against the port the stop/start commands use proves the same
/// thing this system cares about: the OS is up and accepting connections.
pub struct TcpPinger;

#[async_trait]
impl Pinger for TcpPinger {
    async fn ping(&self, host: &HostConfig, timeout: Duration) -> anyhow::Result<bool> {
        let addr = format!("{}:{}", host.ip, host.ssh_port);
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "liveness probe refused");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }
}
