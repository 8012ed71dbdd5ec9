//! UDP forwarder: stateless request/response datagram relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{HostDefaults, ProxyConfig};
use crate::controller::HostHandle;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// One UDP listen port relaying request/response pairs to one port on the
/// host.
///
/// Each inbound datagram is forwarded through a fresh ephemeral socket; at
/// most one reply is awaited (bounded by the reply timeout) and relayed back
/// to the original sender. No wake integration: a sleeping host simply does
/// not answer, which is indistinguishable from a lost datagram to the client.
pub struct UdpProxy {
    name: String,
    listen_addr: SocketAddr,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    reply_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl UdpProxy {
    pub async fn new(
        config: &ProxyConfig,
        target_host: &str,
        host: Arc<dyn HostHandle>,
        defaults: &HostDefaults,
    ) -> anyhow::Result<Self> {
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));

        let target = format!("{}:{}", target_host, config.target_port);
        let target_addr = lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve target address {}", target))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("No address records for {}", target))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            name: config.name.clone(),
            listen_addr,
            target_addr,
            host,
            reply_timeout: defaults.udp_reply_timeout(),
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            recv_task: Mutex::new(None),
            bound_addr: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Bind the listen socket and spawn the receive loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))?;
        let bound = socket.local_addr()?;
        *self.bound_addr.lock() = Some(bound);

        info!(proxy = %self.name, addr = %bound, target = %self.target_addr, "UDP proxy listening");

        let task = tokio::spawn(recv_loop(
            Arc::new(socket),
            self.name.clone(),
            self.target_addr,
            Arc::clone(&self.host),
            self.reply_timeout,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.active),
            Arc::clone(&self.drained),
        ));
        *self.recv_task.lock() = Some(task);

        Ok(())
    }

    /// Signal shutdown and wait for the receive loop and every in-flight
    /// relay to finish. Bounded by the reply timeout.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        debug!(proxy = %self.name, "UDP proxy stopped");
    }
}

struct RelayGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    socket: Arc<UdpSocket>,
    name: String,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    reply_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, client)) => {
                        let datagram = buf[..n].to_vec();
                        let socket = Arc::clone(&socket);
                        let host = Arc::clone(&host);
                        let name = name.clone();

                        active.fetch_add(1, Ordering::SeqCst);
                        let guard = RelayGuard {
                            active: Arc::clone(&active),
                            drained: Arc::clone(&drained),
                        };

                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) =
                                relay(socket, datagram, client, target_addr, host, reply_timeout)
                                    .await
                            {
                                debug!(proxy = %name, %client, error = %e, "datagram relay failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(proxy = %name, error = %e, "Failed to receive datagram");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(proxy = %name, "receive loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Forward one datagram upstream, await at most one reply, relay it back.
async fn relay(
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    client: SocketAddr,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    reply_timeout: Duration,
) -> anyhow::Result<()> {
    host.report_activity();

    let upstream = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind relay socket")?;
    upstream
        .send_to(&datagram, target_addr)
        .await
        .context("Failed to forward datagram")?;

    let mut reply = vec![0u8; MAX_DATAGRAM_SIZE];
    match tokio::time::timeout(reply_timeout, upstream.recv(&mut reply)).await {
        Ok(Ok(n)) => {
            host.report_activity();
            socket
                .send_to(&reply[..n], client)
                .await
                .context("Failed to relay reply")?;
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("Failed to receive reply"),
        // No answer within the deadline. UDP is lossy by contract, the
        // client retries if it cares
        Err(_) => Ok(()),
    }
}
