//! Failure taxonomy for waking hosts and running remote commands.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`HostController::wake`](crate::controller::HostController::wake).
///
/// A wake failure reverts the state machine to `Stopped`; the pending
/// connection is closed and the next connection gets a fresh attempt.
#[derive(Debug, Error)]
pub enum WakeError {
    /// Neither start_command nor mac_address is configured
    #[error("no start method configured (set start_command or mac_address)")]
    NoStartMethod,

    /// The start action itself failed (remote command or WOL send)
    #[error("start action failed: {0}")]
    StartAction(#[source] anyhow::Error),

    /// The host never answered the liveness probe
    #[error("host did not become reachable within {0:?}")]
    Unreachable(Duration),
}

/// Errors from the SSH command runner
#[derive(Debug, Error)]
pub enum CommandError {
    /// Could not reach the SSH port in time
    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// The server rejected the offered credentials
    #[error("authentication rejected for user {user}")]
    AuthRejected { user: String },

    /// Host has neither a password nor a key path configured
    #[error("no ssh credentials configured (set ssh_password or ssh_key_path)")]
    NoCredentials,

    /// The remote command ran but exited non-zero
    #[error("remote command exited with status {status}")]
    Failed { status: u32 },

    /// The command did not finish within the configured timeout
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    /// SSH transport error
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh_keys::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
