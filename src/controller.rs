//! Drives a host's state machine: wake on demand, sleep when idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{HostConfig, HostDefaults};
use crate::error::WakeError;
use crate::remote::{CommandRunner, Pinger};
use crate::state::{HostState, StateCell};
use crate::wol;

/// The capability a proxy holds on its host.
///
/// Proxies never own the host; they get this narrow interface so the
/// object graph stays acyclic and tests can substitute a mock.
#[async_trait]
pub trait HostHandle: Send + Sync {
    /// Current lifecycle state
    fn state(&self) -> HostState;

    /// Start the host if it is stopped. Idempotent: a no-op while the host
    /// is already starting or started.
    async fn wake(&self) -> Result<(), WakeError>;

    /// Block until the host reports Started, or `timeout` elapses.
    async fn wait_started(&self, timeout: Duration) -> bool;

    /// Reset the host's idle clock
    fn report_activity(&self);
}

/// Owns the [`StateCell`] and the idle-based auto-stop policy for one host.
///
/// Returned as `Arc<Self>` because every proxy of the host holds a handle.
/// The start and stop sequences are serialized through one async mutex, so
/// at most one physical transition runs at a time no matter how many
/// connections race in.
pub struct HostController {
    config: Arc<RwLock<HostConfig>>,
    defaults: HostDefaults,
    state: StateCell,
    last_activity: Mutex<Instant>,
    transition_lock: tokio::sync::Mutex<()>,
    runner: Arc<dyn CommandRunner>,
    pinger: Arc<dyn Pinger>,
}

impl HostController {
    pub fn new(
        config: Arc<RwLock<HostConfig>>,
        defaults: HostDefaults,
        runner: Arc<dyn CommandRunner>,
        pinger: Arc<dyn Pinger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            defaults,
            state: StateCell::new(HostState::Stopped),
            last_activity: Mutex::new(Instant::now()),
            transition_lock: tokio::sync::Mutex::new(()),
            runner,
            pinger,
        })
    }

    pub fn state(&self) -> HostState {
        self.state.get()
    }

    /// How long the host has gone without proxied traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Start the host if necessary. See [`HostHandle::wake`].
    pub async fn wake(&self) -> Result<(), WakeError> {
        if matches!(self.state.get(), HostState::Starting | HostState::Started) {
            return Ok(());
        }

        let _guard = self.transition_lock.lock().await;

        // Re-check under the lock: another connection may have completed the
        // start sequence, or a stop just finished and we start fresh
        if matches!(self.state.get(), HostState::Starting | HostState::Started) {
            return Ok(());
        }

        let config = self.config.read().clone();
        info!(host = %config.name, "waking host");
        self.state.set(HostState::Starting);

        if let Err(e) = self.issue_start(&config).await {
            self.state.set(HostState::Stopped);
            return Err(e);
        }

        match self.await_reachable(&config).await {
            Ok(elapsed) => {
                self.state.set(HostState::Started);
                self.report_activity();
                info!(host = %config.name, startup_ms = elapsed.as_millis() as u64, "host is up");
                Ok(())
            }
            Err(e) => {
                warn!(host = %config.name, error = %e, "wake failed");
                self.state.set(HostState::Stopped);
                Err(e)
            }
        }
    }

    /// Issue the configured start action: a remote command when one is set,
    /// otherwise a Wake-on-LAN magic packet.
    async fn issue_start(&self, config: &HostConfig) -> Result<(), WakeError> {
        if let Some(command) = &config.start_command {
            self.runner
                .run_remote_command(config, command)
                .await
                .map_err(WakeError::StartAction)
        } else if let Some(mac) = &config.mac_address {
            wol::send_magic_packet(mac)
                .await
                .map_err(WakeError::StartAction)
        } else {
            Err(WakeError::NoStartMethod)
        }
    }

    /// Poll the liveness collaborator until the host answers or the wake
    /// timeout elapses. Returns the elapsed startup time.
    async fn await_reachable(&self, config: &HostConfig) -> Result<Duration, WakeError> {
        let timeout = self.defaults.wake_timeout();
        let started = Instant::now();

        loop {
            match self.pinger.ping(config, self.defaults.ping_timeout()).await {
                Ok(true) => return Ok(started.elapsed()),
                Ok(false) => {}
                Err(e) => debug!(host = %config.name, error = %e, "liveness probe error"),
            }

            if started.elapsed() >= timeout {
                return Err(WakeError::Unreachable(timeout));
            }
            tokio::time::sleep(self.defaults.ping_interval()).await;
        }
    }

    /// Stop the host when autostop is enabled and it has been idle for at
    /// least its max-alive time. Called from the host's reaper ticker.
    pub async fn sleep_if_idle(&self) {
        let (autostop, max_alive) = {
            let config = self.config.read();
            (config.autostop, config.max_alive(&self.defaults))
        };

        if !autostop || self.state.get() != HostState::Started || self.idle_for() < max_alive {
            return;
        }

        let _guard = self.transition_lock.lock().await;

        // Activity or another transition may have arrived while we waited
        if self.state.get() != HostState::Started || self.idle_for() < max_alive {
            return;
        }

        let config = self.config.read().clone();
        info!(
            host = %config.name,
            idle_secs = self.idle_for().as_secs(),
            "putting idle host to sleep"
        );
        self.state.set(HostState::Stopping);

        match self
            .runner
            .run_remote_command(&config, config.stop_command())
            .await
        {
            Ok(()) => {
                self.state.set(HostState::Stopped);
                info!(host = %config.name, "host stopped");
            }
            Err(e) => {
                // The machine is presumably still up; resume serving and let
                // the next reaper tick retry
                warn!(host = %config.name, error = %e, "stop command failed");
                self.state.set(HostState::Started);
            }
        }
    }
}

#[async_trait]
impl HostHandle for HostController {
    fn state(&self) -> HostState {
        self.state.get()
    }

    async fn wake(&self) -> Result<(), WakeError> {
        HostController::wake(self).await
    }

    async fn wait_started(&self, timeout: Duration) -> bool {
        self.state.wait_for(HostState::Started, timeout).await
    }

    fn report_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}
