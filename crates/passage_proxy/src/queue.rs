//! Bounded per-table mirror queues with a pause latch.
//!
//! Queues are created once, when the Start update arrives, and live for the
//! rest of the process. Pausing a table seizes its latch so the worker stops
//! between queries; queries keep accumulating in the channel meanwhile, up
//! to its capacity, at which point enqueueing blocks the mirror path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};

use crate::mirror::MirrorQuery;

/// Capacity of each per-table queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// Send side and pause state for one table's mirror queue.
pub struct TableQueue {
    tx: mpsc::Sender<MirrorQuery>,
    latch: Arc<AsyncMutex<()>>,
    paused: AtomicBool,
    pause_guard: Mutex<Option<OwnedMutexGuard<()>>>,
    depth: AtomicUsize,
}

impl TableQueue {
    /// Create a queue; the receiver goes to the table's worker.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<MirrorQuery>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue = Arc::new(Self {
            tx,
            latch: Arc::new(AsyncMutex::new(())),
            paused: AtomicBool::new(false),
            pause_guard: Mutex::new(None),
            depth: AtomicUsize::new(0),
        });
        (queue, rx)
    }

    /// Queue one mirrored query. Blocks when the queue is full, which
    /// backpressures the classifying forwarder rather than dropping writes.
    pub async fn enqueue(&self, query: MirrorQuery) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(query).await.is_err() {
            // Worker is gone (shutdown); the query is dropped with it.
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Take the execution gate. The worker holds this around each query so a
    /// paused table blocks between queries, never mid-write.
    pub async fn gate(&self) -> MutexGuard<'_, ()> {
        self.latch.lock().await
    }

    /// Worker bookkeeping after finishing one query.
    pub fn mark_done(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Queries enqueued but not yet executed.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Seize the latch so the worker stops consuming. Idempotent; waits for
    /// an in-flight query to finish before returning.
    pub async fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let guard = self.latch.clone().lock_owned().await;
        if self.paused.load(Ordering::SeqCst) {
            if let Ok(mut slot) = self.pause_guard.lock() {
                *slot = Some(guard);
            }
        }
        // A resume that raced us wins: the guard drops here and the worker
        // keeps running.
    }

    /// Release the latch and let the worker resume. No-op when not paused.
    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.pause_guard.lock() {
            slot.take();
        }
    }
}

/// All table queues, keyed `(keyspace, table)`.
#[derive(Default)]
pub struct MirrorQueues {
    queues: RwLock<HashMap<(String, String), Arc<TableQueue>>>,
}

impl MirrorQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue for a table, handing back the worker's receiver.
    /// Returns `None` when the table already has one: queues are created
    /// exactly once and never replaced.
    pub fn install(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Option<(Arc<TableQueue>, mpsc::Receiver<MirrorQuery>)> {
        let Ok(mut queues) = self.queues.write() else {
            return None;
        };
        let key = (keyspace.to_string(), table.to_string());
        if queues.contains_key(&key) {
            return None;
        }
        let (queue, rx) = TableQueue::new();
        queues.insert(key, queue.clone());
        Some((queue, rx))
    }

    pub fn get(&self, keyspace: &str, table: &str) -> Option<Arc<TableQueue>> {
        self.queues
            .read()
            .ok()
            .and_then(|queues| queues.get(&(keyspace.to_string(), table.to_string())).cloned())
    }
}
