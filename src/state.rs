//! Host lifecycle state and the synchronized cell proxies wait on.

use std::time::Duration;

use tokio::sync::watch;

/// State of a managed host
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Host is powered down or asleep
    Stopped,
    /// Start action issued, waiting for the host to become reachable
    Starting,
    /// Host is reachable and accepting traffic
    Started,
    /// Stop action in progress
    Stopping,
}

/// A thread-safe state value with blocking wait-for-transition semantics.
///
/// Backed by a `tokio::sync::watch` channel so every `set` is broadcast to
/// all current waiters; `wait_for` never busy-spins. The controller is the
/// only writer, every proxy bound to the host is a reader.
pub struct StateCell {
    tx: watch::Sender<HostState>,
}

impl StateCell {
    pub fn new(initial: HostState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> HostState {
        *self.tx.borrow()
    }

    /// Replace the current state, releasing all matching waiters.
    pub fn set(&self, next: HostState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "host state transition");
        }
    }

    /// Get a receiver observing every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<HostState> {
        self.tx.subscribe()
    }

    /// Block until the state equals `target` or `timeout` elapses.
    ///
    /// Returns whether the target was reached. Returns immediately when the
    /// current state already matches.
    pub async fn wait_for(&self, target: HostState, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => true,
            // Sender dropped: the cell is gone, treat as failure
            Ok(Err(_)) => false,
            Err(_) => false,
        };
        reached
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}
