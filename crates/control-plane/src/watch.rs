//! Operation event fan-out.
//!
//! Watchers subscribe with a bounded queue. Publishing never blocks the
//! operation path: a watcher that cannot keep up is dropped and learns
//! about it through a queue-overflow marker on its stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use common::api::{OperationEvent, OperationPhase};

/// What a watcher is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Every operation on every node.
    All,
    /// Operations targeting one node.
    Node(Uuid),
    /// One operation.
    Operation(Uuid),
}

impl WatchScope {
    fn matches(&self, event: &OperationEvent) -> bool {
        match self {
            WatchScope::All => true,
            WatchScope::Node(node_id) => event.node_id == *node_id,
            WatchScope::Operation(operation_id) => event.operation_id == *operation_id,
        }
    }
}

#[derive(Debug)]
struct Watcher {
    scope: WatchScope,
    tx: mpsc::Sender<OperationEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Inner {
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

/// Registry of live operation watchers.
#[derive(Debug, Clone)]
pub struct WatchRegistry {
    inner: Arc<Inner>,
}

impl WatchRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                watchers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    /// Register a watcher. Live events start queueing immediately;
    /// callers that want a snapshot first read it *after* this returns
    /// and hand it to [`WatchStream::replay`], so no transition can fall
    /// into the gap between snapshot and registration.
    pub fn subscribe(&self, scope: WatchScope) -> WatchStream {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.watchers.lock().expect("watch registry poisoned").insert(
            id,
            Watcher {
                scope,
                tx,
                overflowed: Arc::clone(&overflowed),
            },
        );
        debug!(watcher = id, "operation watcher registered");

        WatchStream {
            id,
            scope,
            rx,
            pending: VecDeque::new(),
            replayed: HashMap::new(),
            overflowed,
            registry: self.clone(),
        }
    }

    /// Deliver an event to every matching watcher.
    ///
    /// Watchers with a full queue are dropped on the spot. Watchers
    /// scoped to exactly this operation are closed after its terminal
    /// event so their streams end cleanly.
    pub fn publish(&self, event: &OperationEvent) {
        let mut watchers = self.inner.watchers.lock().expect("watch registry poisoned");

        let mut evict: Vec<u64> = Vec::new();
        for (id, watcher) in watchers.iter() {
            if !watcher.scope.matches(event) {
                continue;
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => {
                    if event.done && watcher.scope == WatchScope::Operation(event.operation_id) {
                        evict.push(*id);
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(watcher = id, "operation watcher queue full, dropping watcher");
                    watcher.overflowed.store(true, Ordering::Release);
                    evict.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evict.push(*id);
                }
            }
        }

        for id in evict {
            watchers.remove(&id);
        }
    }

    fn deregister(&self, id: u64) {
        self.inner
            .watchers
            .lock()
            .expect("watch registry poisoned")
            .remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().expect("watch registry poisoned").len()
    }
}

/// Receiving end of a watch subscription. Dropping it deregisters the
/// watcher.
#[derive(Debug)]
pub struct WatchStream {
    id: u64,
    scope: WatchScope,
    rx: mpsc::Receiver<OperationEvent>,
    pending: VecDeque<OperationEvent>,
    replayed: HashMap<Uuid, (DateTime<Utc>, OperationPhase)>,
    overflowed: Arc<AtomicBool>,
    registry: WatchRegistry,
}

impl WatchStream {
    /// Queue snapshot events for delivery ahead of anything live. The
    /// snapshot must have been read after the watcher was registered;
    /// live events it already covers (same operation, not newer than
    /// the snapshot row) are suppressed as duplicates. Entries beyond
    /// the queue depth are clipped oldest-first.
    pub fn replay(&mut self, backlog: Vec<OperationEvent>) {
        let depth = self.registry.inner.queue_depth;
        let skip = backlog.len().saturating_sub(depth);
        for event in backlog.into_iter().skip(skip) {
            if !self.scope.matches(&event) {
                continue;
            }
            self.replayed
                .insert(event.operation_id, (event.timestamp, event.phase));
            self.pending.push_back(event);
        }
    }

    /// Next event, or `None` when the stream has ended (operation done,
    /// registry closed the sender, or the watcher was dropped for
    /// falling behind — check [`WatchStream::overflowed`]).
    pub async fn recv(&mut self) -> Option<OperationEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            let event = self.rx.recv().await?;
            if !self.covered_by_snapshot(&event) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`WatchStream::recv`].
    pub fn try_recv(&mut self) -> Option<OperationEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        while let Ok(event) = self.rx.try_recv() {
            if !self.covered_by_snapshot(&event) {
                return Some(event);
            }
        }
        None
    }

    fn covered_by_snapshot(&self, event: &OperationEvent) -> bool {
        match self.replayed.get(&event.operation_id) {
            Some((timestamp, phase)) => {
                event.timestamp < *timestamp
                    || (event.timestamp == *timestamp && event.phase == *phase)
            }
            None => false,
        }
    }

    /// Whether this watcher was evicted for not keeping up.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::api::OperationPhase;

    fn event(operation_id: Uuid, node_id: Uuid, phase: OperationPhase, done: bool) -> OperationEvent {
        OperationEvent {
            operation_id,
            node_id,
            phase,
            message: String::new(),
            percent: if done { 100 } else { 0 },
            done,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scoped_watcher_only_sees_its_node() {
        let registry = WatchRegistry::new(8);
        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();
        let mut stream = registry.subscribe(WatchScope::Node(node_a));

        registry.publish(&event(Uuid::new_v4(), node_b, OperationPhase::Running, false));
        registry.publish(&event(Uuid::new_v4(), node_a, OperationPhase::Running, false));

        let received = stream.recv().await.expect("event");
        assert_eq!(received.node_id, node_a);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_watcher_is_dropped_with_overflow_flag() {
        let registry = WatchRegistry::new(2);
        let node = Uuid::new_v4();
        let mut stream = registry.subscribe(WatchScope::All);

        for _ in 0..3 {
            registry.publish(&event(Uuid::new_v4(), node, OperationPhase::Running, false));
        }

        assert!(stream.overflowed());
        assert_eq!(registry.watcher_count(), 0);
        // The two queued events are still readable before the end.
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn operation_scoped_stream_ends_after_terminal_event() {
        let registry = WatchRegistry::new(8);
        let op = Uuid::new_v4();
        let node = Uuid::new_v4();
        let mut stream = registry.subscribe(WatchScope::Operation(op));

        registry.publish(&event(op, node, OperationPhase::Running, false));
        registry.publish(&event(op, node, OperationPhase::Succeeded, true));

        assert_eq!(stream.recv().await.unwrap().phase, OperationPhase::Running);
        let last = stream.recv().await.unwrap();
        assert!(last.done);
        assert!(stream.recv().await.is_none());
        assert_eq!(registry.watcher_count(), 0);
    }

    #[tokio::test]
    async fn backlog_is_replayed_before_live_events() {
        let registry = WatchRegistry::new(8);
        let op = Uuid::new_v4();
        let node = Uuid::new_v4();

        let mut stream = registry.subscribe(WatchScope::All);
        stream.replay(vec![event(op, node, OperationPhase::Queued, false)]);
        registry.publish(&event(op, node, OperationPhase::Running, false));

        assert_eq!(stream.recv().await.unwrap().phase, OperationPhase::Queued);
        assert_eq!(stream.recv().await.unwrap().phase, OperationPhase::Running);
    }

    #[tokio::test]
    async fn transition_during_snapshot_read_is_not_lost() {
        let registry = WatchRegistry::new(8);
        let op = Uuid::new_v4();
        let node = Uuid::new_v4();
        let mut stream = registry.subscribe(WatchScope::Operation(op));

        // A transition lands while the subscriber is still reading its
        // snapshot; the snapshot then reflects that same row, so the
        // queued copy must be suppressed, not delivered twice.
        let running = event(op, node, OperationPhase::Running, false);
        registry.publish(&running);
        stream.replay(vec![running.clone()]);
        registry.publish(&event(op, node, OperationPhase::Succeeded, true));

        assert_eq!(stream.recv().await.unwrap().phase, OperationPhase::Running);
        let last = stream.recv().await.unwrap();
        assert!(last.done);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_deregisters_watcher() {
        let registry = WatchRegistry::new(8);
        let stream = registry.subscribe(WatchScope::All);
        assert_eq!(registry.watcher_count(), 1);
        drop(stream);
        assert_eq!(registry.watcher_count(), 0);
    }
}
