//! Deadline-ordered dispatch queue feeding a fixed pool of workers.
//!
//! Every "try this workspace again" request, whether an immediate trigger
//! or a backoff retry, becomes a `(workspace, not_before)` entry. A
//! workspace appears at most once; scheduling it again keeps the earlier
//! deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, info};

use runplane_capacity::BoxFuture;
use runplane_state::{Clock, WorkspaceId};

/// Longest the driver sleeps without re-reading the clock.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Pending workspaces keyed by their earliest allowed run time (ms).
#[derive(Debug, Default)]
pub struct RetryQueue {
    deadlines: HashMap<WorkspaceId, u64>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the entry was added or moved earlier.
    pub fn schedule(&mut self, workspace_id: &str, not_before: u64) -> bool {
        match self.deadlines.get_mut(workspace_id) {
            Some(existing) if *existing <= not_before => false,
            Some(existing) => {
                *existing = not_before;
                true
            }
            None => {
                self.deadlines.insert(workspace_id.to_string(), not_before);
                true
            }
        }
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_due(&mut self, now: u64) -> Vec<WorkspaceId> {
        let mut due: Vec<(u64, WorkspaceId)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(ws, at)| (*at, ws.clone()))
            .collect();
        due.sort();
        for (_, ws) in &due {
            self.deadlines.remove(ws);
        }
        due.into_iter().map(|(_, ws)| ws).collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().min().copied()
    }

    pub fn deadline(&self, workspace_id: &str) -> Option<u64> {
        self.deadlines.get(workspace_id).copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Something that processes one workspace at a time.
pub trait WorkspaceHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, workspace_id: &'a str) -> BoxFuture<'a, ()>;
}

struct QueueInner {
    clock: Arc<dyn Clock>,
    pending: Mutex<RetryQueue>,
    notify: Notify,
}

/// Cloneable handle to the shared queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                clock,
                pending: Mutex::new(RetryQueue::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Run the workspace as soon as a worker is free.
    pub async fn trigger(&self, workspace_id: &str) {
        self.schedule(workspace_id, Duration::ZERO).await;
    }

    /// Run the workspace no earlier than `delay` from now.
    pub async fn schedule(&self, workspace_id: &str, delay: Duration) {
        let not_before = self.inner.clock.now_millis() + delay.as_millis() as u64;
        let changed = self.inner.pending.lock().await.schedule(workspace_id, not_before);
        if changed {
            debug!(%workspace_id, delay_ms = delay.as_millis() as u64, "workspace scheduled");
            self.inner.notify.notify_one();
        }
    }

    /// Pop everything that is due now.
    pub async fn take_due(&self) -> Vec<WorkspaceId> {
        let now = self.inner.clock.now_millis();
        self.inner.pending.lock().await.pop_due(now)
    }

    /// Absolute deadline (ms) of a queued workspace.
    pub async fn deadline(&self, workspace_id: &str) -> Option<u64> {
        self.inner.pending.lock().await.deadline(workspace_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.pending.lock().await.is_empty()
    }

    /// Drive the queue until shutdown, handing due workspaces to `workers`
    /// concurrent handler invocations.
    pub async fn run<H: WorkspaceHandler>(
        &self,
        handler: Arc<H>,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<WorkspaceId>(workers * 4);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = rx.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(workspace_id) = next else { break };
                    handler.handle(&workspace_id).await;
                }
                debug!(worker, "dispatch worker stopped");
            }));
        }
        info!(workers, "dispatch queue started");

        'driver: loop {
            for workspace_id in self.take_due().await {
                if tx.send(workspace_id).await.is_err() {
                    break 'driver;
                }
            }

            let now = self.inner.clock.now_millis();
            let wait = match self.inner.pending.lock().await.next_deadline() {
                Some(at) => Duration::from_millis(at.saturating_sub(now)).min(MAX_IDLE),
                None => MAX_IDLE,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.notify.notified() => {}
                _ = shutdown.changed() => {
                    info!("dispatch queue shutting down");
                    break;
                }
            }
        }

        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}
