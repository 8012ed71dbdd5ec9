//! Host aggregate: one controller plus the proxies bound to it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{HostConfig, HostDefaults, Protocol};
use crate::controller::{HostController, HostHandle};
use crate::remote::{CommandRunner, Pinger};
use crate::state::HostState;
use crate::tcp::TcpProxy;
use crate::udp::UdpProxy;

/// A managed host: its lifecycle controller, its proxies and the idle
/// reaper ticker. Started and stopped as a unit by the registry.
pub struct Host {
    config: Arc<RwLock<HostConfig>>,
    controller: Arc<HostController>,
    tcp_proxies: HashMap<String, Arc<TcpProxy>>,
    udp_proxies: HashMap<String, Arc<UdpProxy>>,
    reaper_tx: watch::Sender<bool>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    /// Build the controller and every configured proxy, bind all listen
    /// sockets and start the idle reaper.
    ///
    /// Fails fast: if any proxy cannot resolve or bind, the ones already
    /// started are torn down and the error is returned. No partial host is
    /// ever registered.
    pub async fn start(
        config: HostConfig,
        defaults: &HostDefaults,
        runner: Arc<dyn CommandRunner>,
        pinger: Arc<dyn Pinger>,
    ) -> anyhow::Result<Arc<Self>> {
        let name = config.name.clone();
        let ip = config.ip.clone();
        let proxy_configs = config.proxies.clone();

        let config = Arc::new(RwLock::new(config));
        let controller = HostController::new(Arc::clone(&config), defaults.clone(), runner, pinger);

        let mut tcp_proxies = HashMap::new();
        let mut udp_proxies = HashMap::new();

        let result: anyhow::Result<()> = async {
            for proxy_config in &proxy_configs {
                let handle: Arc<dyn HostHandle> = controller.clone();
                match proxy_config.protocol {
                    Protocol::Tcp => {
                        let proxy =
                            Arc::new(TcpProxy::new(proxy_config, &ip, handle, defaults).await?);
                        proxy.start().await?;
                        tcp_proxies.insert(proxy_config.name.clone(), proxy);
                    }
                    Protocol::Udp => {
                        let proxy =
                            Arc::new(UdpProxy::new(proxy_config, &ip, handle, defaults).await?);
                        proxy.start().await?;
                        udp_proxies.insert(proxy_config.name.clone(), proxy);
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(host = %name, error = %e, "Failed to start host, rolling back");
            for proxy in tcp_proxies.values() {
                proxy.stop().await;
            }
            for proxy in udp_proxies.values() {
                proxy.stop().await;
            }
            return Err(e);
        }

        let (reaper_tx, reaper_rx) = watch::channel(false);
        let reaper_task = tokio::spawn(reaper_loop(
            name.clone(),
            Arc::clone(&controller),
            defaults.idle_check_interval(),
            reaper_rx,
        ));

        info!(
            host = %name,
            tcp = tcp_proxies.len(),
            udp = udp_proxies.len(),
            "host started"
        );

        Ok(Arc::new(Self {
            config,
            controller,
            tcp_proxies,
            udp_proxies,
            reaper_tx,
            reaper_task: Mutex::new(Some(reaper_task)),
        }))
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn state(&self) -> HostState {
        self.controller.state()
    }

    pub fn controller(&self) -> &Arc<HostController> {
        &self.controller
    }

    pub fn tcp_proxy(&self, name: &str) -> Option<&Arc<TcpProxy>> {
        self.tcp_proxies.get(name)
    }

    pub fn udp_proxy(&self, name: &str) -> Option<&Arc<UdpProxy>> {
        self.udp_proxies.get(name)
    }

    /// Whether `new` keeps the same proxy set. A changed set means the host
    /// must be recreated; anything else can be swapped in place.
    pub fn proxy_set_matches(&self, new: &HostConfig) -> bool {
        self.config.read().proxies == new.proxies
    }

    /// Replace the stored configuration. Listen sockets are untouched; the
    /// caller guarantees the proxy set is unchanged.
    pub fn update_config(&self, new: HostConfig) {
        debug!(host = %new.name, "updating host configuration in place");
        *self.config.write() = new;
    }

    /// Stop the reaper and every proxy. Synchronous: when this returns, all
    /// listen sockets are closed and all connection handlers have exited.
    pub async fn stop(&self) {
        let name = self.name();
        let _ = self.reaper_tx.send(true);
        let task = self.reaper_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        for proxy in self.tcp_proxies.values() {
            proxy.stop().await;
        }
        for proxy in self.udp_proxies.values() {
            proxy.stop().await;
        }

        info!(host = %name, "host stopped");
    }
}

/// Periodically asks the controller to put the host to sleep when idle.
async fn reaper_loop(
    name: String,
    controller: Arc<HostController>,
    period: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // The immediate first tick is pointless here
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.sleep_if_idle().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(host = %name, "reaper shutting down");
                    break;
                }
            }
        }
    }
}
