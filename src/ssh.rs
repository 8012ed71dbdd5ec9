//! Production [`CommandRunner`] that executes start/stop commands over SSH.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::error::CommandError;
use crate::remote::CommandRunner;

/// Executes remote commands over SSH with password or key authentication.
pub struct SshCommandRunner {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshCommandRunner {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    async fn connect(&self, host: &HostConfig) -> Result<Handle<AcceptingHandler>, CommandError> {
        enum Auth<'a> {
            Key(&'a str),
            Password(&'a str),
        }

        // Resolve credentials before dialing so a misconfigured host fails
        // without touching the network
        let auth = if let Some(key_path) = &host.ssh_key_path {
            Auth::Key(key_path)
        } else if let Some(password) = &host.ssh_password {
            Auth::Password(password)
        } else {
            return Err(CommandError::NoCredentials);
        };

        let config = Arc::new(client::Config::default());
        let addr = format!("{}:{}", host.ip, host.ssh_port);

        debug!(%addr, "connecting for remote command");
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, addr.as_str(), AcceptingHandler),
        )
        .await
        .map_err(|_| CommandError::ConnectTimeout { addr: addr.clone() })??;

        let authenticated = match auth {
            Auth::Key(key_path) => {
                let key = russh_keys::load_secret_key(key_path, None)?;
                session
                    .authenticate_publickey(&host.ssh_username, Arc::new(key))
                    .await?
            }
            Auth::Password(password) => {
                session
                    .authenticate_password(&host.ssh_username, password)
                    .await?
            }
        };

        if !authenticated {
            return Err(CommandError::AuthRejected {
                user: host.ssh_username.clone(),
            });
        }

        Ok(session)
    }

    async fn exec(&self, host: &HostConfig, command: &str) -> Result<(), CommandError> {
        let session = self.connect(host).await?;

        let mut channel = session.channel_open_session().await?;
        channel.exec(true, command).await?;

        // Drain channel messages until close, remembering the exit status
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Data { .. } | ChannelMsg::ExtendedData { .. } => {}
                _ => {}
            }
        }

        let _ = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match exit_status {
            Some(0) | None => Ok(()),
            Some(status) => Err(CommandError::Failed { status }),
        }
    }
}

impl Default for SshCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    async fn run_remote_command(&self, host: &HostConfig, command: &str) -> anyhow::Result<()> {
        debug!(host = %host.name, command, "running remote command");

        let result = tokio::time::timeout(self.command_timeout, self.exec(host, command))
            .await
            .map_err(|_| CommandError::Timeout(self.command_timeout))?;

        if let Err(e) = &result {
            warn!(host = %host.name, command, error = %e, "remote command failed");
        }
        Ok(result?)
    }
}

/// Host keys are not verified: the fleet lives on a trusted home network and
/// hosts are addressed by configured IP.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(fingerprint = %server_public_key.fingerprint(), "accepting host key");
        Ok(true)
    }
}
