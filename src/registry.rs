//! Registry of running hosts and configuration reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info};

use crate::config::{Config, HostConfig, HostDefaults};
use crate::host::Host;
use crate::remote::{CommandRunner, Pinger};

/// Outcome of one reconciliation pass, by host name.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub recreated: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The live map of hosts, keyed by upper-cased name.
///
/// `apply_config` is the single mutation point; it is serialized through an
/// async mutex so overlapping reloads cannot interleave. Reads (`get`,
/// status collaborators) go straight to the map.
pub struct HostRegistry {
    hosts: DashMap<String, Arc<Host>>,
    runner: Arc<dyn CommandRunner>,
    pinger: Arc<dyn Pinger>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl HostRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>, pinger: Arc<dyn Pinger>) -> Arc<Self> {
        Arc::new(Self {
            hosts: DashMap::new(),
            runner,
            pinger,
            apply_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Reconcile the running hosts against `config`.
    ///
    /// Hosts absent from the new configuration are stopped and dropped.
    /// New entries are created. Existing entries are updated in place when
    /// their proxy set is unchanged, otherwise stopped and recreated so the
    /// listen sockets match the new set. A host that fails to start is
    /// reported in `failed` and does not abort the rest of the pass.
    pub async fn apply_config(&self, config: &Config) -> ReconcileResult {
        let _guard = self.apply_lock.lock().await;
        let mut result = ReconcileResult::default();

        let desired: HashMap<String, &HostConfig> =
            config.hosts.iter().map(|h| (h.key(), h)).collect();

        let stale: Vec<String> = self
            .hosts
            .iter()
            .filter(|entry| !desired.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            if let Some((_, host)) = self.hosts.remove(&key) {
                let name = host.name();
                host.stop().await;
                result.removed.push(name);
            }
        }

        for host_config in &config.hosts {
            let key = host_config.key();
            let existing = self.hosts.get(&key).map(|e| Arc::clone(e.value()));

            match existing {
                Some(host) if host.proxy_set_matches(host_config) => {
                    host.update_config(host_config.clone());
                    result.updated.push(host_config.name.clone());
                }
                Some(host) => {
                    // Proxy set changed: tear down first so the old listen
                    // sockets are free before the replacement binds
                    self.hosts.remove(&key);
                    host.stop().await;
                    match self.start_host(host_config, &config.defaults).await {
                        Ok(host) => {
                            self.hosts.insert(key, host);
                            result.recreated.push(host_config.name.clone());
                        }
                        Err(e) => {
                            error!(host = %host_config.name, error = %e, "Failed to recreate host");
                            result.failed.push(host_config.name.clone());
                        }
                    }
                }
                None => match self.start_host(host_config, &config.defaults).await {
                    Ok(host) => {
                        self.hosts.insert(key, host);
                        result.created.push(host_config.name.clone());
                    }
                    Err(e) => {
                        error!(host = %host_config.name, error = %e, "Failed to create host");
                        result.failed.push(host_config.name.clone());
                    }
                },
            }
        }

        info!(
            created = result.created.len(),
            updated = result.updated.len(),
            recreated = result.recreated.len(),
            removed = result.removed.len(),
            failed = result.failed.len(),
            "configuration applied"
        );
        result
    }

    async fn start_host(
        &self,
        config: &HostConfig,
        defaults: &HostDefaults,
    ) -> anyhow::Result<Arc<Host>> {
        Host::start(
            config.clone(),
            defaults,
            Arc::clone(&self.runner),
            Arc::clone(&self.pinger),
        )
        .await
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<Arc<Host>> {
        self.hosts
            .get(&name.to_uppercase())
            .map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|e| e.value().name()).collect()
    }

    /// Stop every host. Used on process shutdown.
    pub async fn shutdown(&self) {
        let _guard = self.apply_lock.lock().await;
        let keys: Vec<String> = self.hosts.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, host)) = self.hosts.remove(&key) {
                host.stop().await;
            }
        }
        info!("all hosts stopped");
    }
}
