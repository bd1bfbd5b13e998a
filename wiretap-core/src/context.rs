//! Connection context and the structured task-group
//! cancellation model.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fires once, broadcasting to every task spawned under a [`TaskGroup`]. Cloning is
/// cheap; every clone observes the same signal.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called; resolves immediately if
    /// it already has been.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped join point for a single connection's reader/writer/engine tasks: every
/// task shares one [`CancelSignal`], and any task returning a fatal error cancels every
/// other task in the group.
#[derive(Clone)]
pub struct TaskGroup {
    cancel: CancelSignal,
    handles: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self { cancel: CancelSignal::new(), handles: Arc::new(parking_lot::Mutex::new(Vec::new())) }
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Spawns `fut` under this group. If it completes with `Err`, the whole group is
    /// cancelled so sibling tasks unwind promptly instead of leaking.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<(), crate::error::Error>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
                if let Err(err) = fut.await {
                    tracing::warn!(error = %err, "task group member failed, cancelling siblings");
                    cancel.cancel();
                }
            });
        self.handles.lock().push(handle);
    }

    /// Waits for every spawned task to finish (normally because the cancel signal fired
    /// and each task observed it at its next suspension point).
    pub async fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Which wire direction a byte stream plays in a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Record,
    Replay,
}

/// Carries everything an engine needs about the connection it was handed:
/// identifiers for logging/metadata, the cancel signal, and the mode to run in.
#[derive(Clone)]
pub struct ConnectionContext {
    pub client_conn_id: ConnId,
    pub destination_conn_id: Option<ConnId>,
    pub mode: Mode,
    pub tasks: TaskGroup,
}

impl ConnectionContext {
    pub fn new(client_conn_id: ConnId, mode: Mode) -> Self {
        Self { client_conn_id, destination_conn_id: None, mode, tasks: TaskGroup::new() }
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.tasks.cancel_signal()
    }
}

/// Opaque connection identifier, assigned by the (out-of-scope) traffic-capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
