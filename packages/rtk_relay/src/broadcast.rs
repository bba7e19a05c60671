use std::sync::atomic::{AtomicU64, Ordering};

use relay_io::Endpoint;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Registry handle for one downstream sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriberId,
    sink: Box<dyn Endpoint>,
}

/// Set of downstream sinks that each receive every broadcast payload.
///
/// Holds one mutex across a whole broadcast sweep so subscribers never
/// observe reordered data. A sink whose write fails is closed and
/// removed during the same sweep; delivery to it is best-effort by
/// design, it is pruned rather than throttled.
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    /// Latest connection wins: registering closes and replaces any
    /// current occupant instead of joining it.
    single_slot: bool,
}

impl SubscriberRegistry {
    pub fn new(single_slot: bool) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            single_slot,
        }
    }

    pub async fn register(&self, sink: Box<dyn Endpoint>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.lock().await;
        if self.single_slot {
            for mut old in subs.drain(..) {
                debug!(replaced = %old.id, by = %id, "single-slot replacement");
                old.sink.close().await;
            }
        }
        debug!(%id, sink = sink.label(), "subscriber registered");
        subs.push(Subscriber { id, sink });
        id
    }

    /// Write `data` to every sink, pruning the ones that fail. Returns
    /// the number of sinks that received the payload.
    pub async fn broadcast(&self, data: &[u8]) -> usize {
        let mut subs = self.subscribers.lock().await;
        let mut failed = Vec::new();
        let mut delivered = 0;

        for sub in subs.iter_mut() {
            match sub.sink.write_all(data).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(id = %sub.id, sink = sub.sink.label(), error = %e,
                          "subscriber write failed, pruning");
                    failed.push(sub.id);
                }
            }
        }
        for id in failed {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs[pos].sink.close().await;
                subs.remove(pos);
            }
        }
        delivered
    }

    /// Remove and close a sink. Safe to call for an id that is already
    /// gone (pruned by a broadcast sweep, or replaced in single-slot
    /// mode).
    pub async fn remove(&self, id: SubscriberId) {
        let mut subs = self.subscribers.lock().await;
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            debug!(%id, "subscriber removed");
            subs[pos].sink.close().await;
            subs.remove(pos);
        }
    }

    pub async fn count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Close and drop every sink. Used at relay teardown.
    pub async fn close_all(&self) {
        let mut subs = self.subscribers.lock().await;
        for sub in subs.iter_mut() {
            sub.sink.close().await;
        }
        subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_io::EndpointError;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    /// Sink double that records writes and can be told to start failing.
    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<StdMutex<Vec<u8>>>,
        fail: Arc<StdMutex<bool>>,
        closed: Arc<StdMutex<u32>>,
    }

    #[async_trait]
    impl Endpoint for RecordingSink {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, EndpointError> {
            Ok(0)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
            if *self.fail.lock().unwrap() {
                return Err(EndpointError::Closed);
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }

        fn label(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_sinks_in_order() {
        let registry = SubscriberRegistry::new(false);
        let sinks: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        for sink in &sinks {
            registry.register(Box::new(sink.clone())).await;
        }

        registry.broadcast(b"first").await;
        registry.broadcast(b"second").await;

        for sink in &sinks {
            assert_eq!(sink.written.lock().unwrap().as_slice(), b"firstsecond");
        }
    }

    #[tokio::test]
    async fn failing_sink_is_pruned_others_unaffected() {
        let registry = SubscriberRegistry::new(false);
        let good_a = RecordingSink::default();
        let bad = RecordingSink::default();
        let good_b = RecordingSink::default();
        registry.register(Box::new(good_a.clone())).await;
        registry.register(Box::new(bad.clone())).await;
        registry.register(Box::new(good_b.clone())).await;

        assert_eq!(registry.broadcast(b"one").await, 3);
        *bad.fail.lock().unwrap() = true;
        assert_eq!(registry.broadcast(b"two").await, 2);
        assert_eq!(registry.count().await, 2);
        assert_eq!(*bad.closed.lock().unwrap(), 1);

        assert_eq!(registry.broadcast(b"three").await, 2);
        assert_eq!(good_a.written.lock().unwrap().as_slice(), b"onetwothree");
        assert_eq!(good_b.written.lock().unwrap().as_slice(), b"onetwothree");
        assert_eq!(bad.written.lock().unwrap().as_slice(), b"one");
    }

    #[tokio::test]
    async fn single_slot_latest_connection_wins() {
        let registry = SubscriberRegistry::new(true);
        let first = RecordingSink::default();
        let second = RecordingSink::default();

        registry.register(Box::new(first.clone())).await;
        registry.broadcast(b"a").await;
        registry.register(Box::new(second.clone())).await;
        registry.broadcast(b"b").await;

        assert_eq!(registry.count().await, 1);
        assert_eq!(*first.closed.lock().unwrap(), 1);
        assert_eq!(first.written.lock().unwrap().as_slice(), b"a");
        assert_eq!(second.written.lock().unwrap().as_slice(), b"b");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SubscriberRegistry::new(false);
        let sink = RecordingSink::default();
        let id = registry.register(Box::new(sink.clone())).await;

        registry.remove(id).await;
        registry.remove(id).await;
        assert_eq!(registry.count().await, 0);
        assert_eq!(*sink.closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = SubscriberRegistry::new(false);
        let a = RecordingSink::default();
        let b = RecordingSink::default();
        registry.register(Box::new(a.clone())).await;
        registry.register(Box::new(b.clone())).await;

        registry.close_all().await;
        assert_eq!(registry.count().await, 0);
        assert_eq!(*a.closed.lock().unwrap(), 1);
        assert_eq!(*b.closed.lock().unwrap(), 1);
    }
}
