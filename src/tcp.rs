//! TCP proxy: accept, peek, wake the host if needed, then splice bytes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{HostDefaults, ProxyConfig};
use crate::controller::HostHandle;
use crate::state::HostState;

/// Size of the initial read used for status-probe sniffing
const PEEK_BUFFER_SIZE: usize = 512;
/// Chunk size of the splice copy loops
const COPY_BUFFER_SIZE: usize = 8192;

/// One TCP listen port forwarding to one port on the host.
///
/// `start()` binds the listener and accepts until `stop()`, which signals
/// shutdown and blocks until every in-flight connection handler has exited.
pub struct TcpProxy {
    name: String,
    listen_addr: SocketAddr,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    peek_timeout: Duration,
    wake_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl TcpProxy {
    /// Build a proxy for `config`, forwarding to `target_host`.
    ///
    /// Addresses are resolved here, once; a resolution failure aborts
    /// construction (and, transitively, the owning host).
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
            peek_timeout: defaults.peek_timeout(),
            wake_timeout: defaults.wake_timeout(),
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            accept_task: Mutex::new(None),
            bound_addr: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is actually bound to (set by `start()`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the listen socket and spawn the accept loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))?;
        let bound = listener.local_addr()?;
        *self.bound_addr.lock() = Some(bound);

        info!(proxy = %self.name, addr = %bound, target = %self.target_addr, "TCP proxy listening");

        let task = tokio::spawn(accept_loop(
            listener,
            self.name.clone(),
            self.target_addr,
            Arc::clone(&self.host),
            self.peek_timeout,
            self.wake_timeout,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.active),
            Arc::clone(&self.drained),
        ));
        *self.accept_task.lock() = Some(task);

        Ok(())
    }

    /// Signal shutdown, close the listener and wait for every connection
    /// handler to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        loop {
            // Create the notified future before the check so a handler
            // exiting in between cannot be missed
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        debug!(proxy = %self.name, "TCP proxy stopped");
    }
}

/// Decrements the in-flight counter when a connection handler exits,
/// however it exits.
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    name: String,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    peek_timeout: Duration,
    wake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let name = name.clone();
                        let host = Arc::clone(&host);
                        let conn_shutdown = shutdown_rx.clone();

                        active.fetch_add(1, Ordering::SeqCst);
                        let guard = ConnectionGuard {
                            active: Arc::clone(&active),
                            drained: Arc::clone(&drained),
                        };

                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) = handle_connection(
                                stream,
                                peer,
                                target_addr,
                                host,
                                peek_timeout,
                                wake_timeout,
                                conn_shutdown,
                            )
                            .await
                            {
                                debug!(proxy = %name, %peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(proxy = %name, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(proxy = %name, "accept loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    target_addr: SocketAddr,
    host: Arc<dyn HostHandle>,
    peek_timeout: Duration,
    wake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut peeked = vec![0u8; PEEK_BUFFER_SIZE];
    let n = match tokio::time::timeout(peek_timeout, client.read(&mut peeked)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e).context("initial read failed"),
        // No bytes before the deadline. Server-talks-first protocols (ssh
        // among them) send nothing until the server banner, so an empty
        // peek proceeds to wake
        Err(_) => 0,
    };
    peeked.truncate(n);

    let state = host.state();
    if matches!(state, HostState::Stopped | HostState::Stopping) && is_status_probe(&peeked) {
        debug!(%peer, "status probe while host is down, not waking");
        return Ok(());
    }

    if state != HostState::Started {
        host.wake().await?;

        let started = tokio::select! {
            ok = host.wait_started(wake_timeout) => ok,
            _ = wait_shutdown(&mut shutdown_rx) => false,
        };
        if !started {
            anyhow::bail!("host did not reach started within {:?}", wake_timeout);
        }
    }

    host.report_activity();

    let mut upstream = TcpStream::connect(target_addr)
        .await
        .with_context(|| format!("Failed to connect to upstream {}", target_addr))?;

    // The peeked bytes were consumed from the client socket and are not
    // re-sent by anyone else; they go upstream first
    if !peeked.is_empty() {
        upstream
            .write_all(&peeked)
            .await
            .context("Failed to forward initial bytes")?;
    }

    splice(client, upstream, host, shutdown_rx, peer).await;
    Ok(())
}

/// A liveness check from a monitoring client: an HTTP request carrying a
/// `Status: true` header. Must never wake the host.
fn is_status_probe(peeked: &[u8]) -> bool {
    let text = String::from_utf8_lossy(peeked);
    text.contains("HTTP") && text.contains("Status: true")
}

/// Copy bytes in both directions until either side closes or shutdown is
/// signaled. Dropping the halves on return closes both sockets.
async fn splice(
    client: TcpStream,
    upstream: TcpStream,
    host: Arc<dyn HostHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
    peer: SocketAddr,
) {
    let (mut client_r, mut client_w) = client.into_split();
    let (mut upstream_r, mut upstream_w) = upstream.into_split();

    let client_to_upstream = copy_reporting(&mut client_r, &mut upstream_w, &host);
    let upstream_to_client = copy_reporting(&mut upstream_r, &mut client_w, &host);
    tokio::pin!(client_to_upstream, upstream_to_client);

    tokio::select! {
        r = &mut client_to_upstream => match r {
            Ok(bytes) => debug!(%peer, bytes, "client closed"),
            Err(e) => debug!(%peer, error = %e, "client to upstream copy ended"),
        },
        r = &mut upstream_to_client => match r {
            Ok(bytes) => debug!(%peer, bytes, "upstream closed"),
            Err(e) => debug!(%peer, error = %e, "upstream to client copy ended"),
        },
        _ = wait_shutdown(&mut shutdown_rx) => {
            debug!(%peer, "splice cancelled by shutdown");
        }
    }
}

/// Copy loop that resets the host's idle clock for every forwarded chunk.
async fn copy_reporting<R, W>(
    reader: &mut R,
    writer: &mut W,
    host: &Arc<dyn HostHandle>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        host.report_activity();
        total += n as u64;
    }
}

/// Resolve when shutdown is (or already was) signaled. A dropped sender
/// counts as shutdown.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}
