//! Fan-out of control states to observers.
//!
//! Each subscriber gets its own bounded queue. Publishing never waits: a full
//! queue drops that tick for that subscriber only, and a closed queue is
//! pruned from the registry. The registry itself is copy-on-write so publish
//! iterates a stable list while subscribe/unsubscribe swap in a new one.

use chrono::{DateTime, Utc};
use kiln_shared::config::WatcherConfig;
use kiln_shared::{ControlState, StateSink, WatchEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SubscriberId = u64;

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Backlog {
    profile: Option<String>,
    log: VecDeque<Arc<ControlState>>,
}

#[derive(Debug)]
struct Inner {
    backlog: Mutex<Backlog>,
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
    buffer: usize,
}

/// State broadcaster. Clones share the same registry and backlog.
#[derive(Debug, Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl Watcher {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backlog: Mutex::new(Backlog::default()),
                subscribers: RwLock::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                capacity: config.backlog_capacity.max(1),
                // The backlog event must always fit in a fresh queue.
                buffer: config.subscriber_buffer.max(1),
            }),
        }
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.inner.backlog.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registry(&self) -> Arc<Vec<Subscriber>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a raw queue. The backlog is already waiting in it.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // Holding the backlog lock keeps a concurrent publish from landing
        // between the backlog snapshot and registration.
        let backlog = self.backlog();
        let event = WatchEvent::Backlog {
            profile: backlog.profile.clone(),
            log: backlog.log.iter().cloned().collect(),
        };
        let _ = tx.try_send(event);
        {
            let mut subscribers = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
            let mut next: Vec<Subscriber> = subscribers
                .iter()
                .map(|s| Subscriber {
                    id: s.id,
                    tx: s.tx.clone(),
                })
                .collect();
            next.push(Subscriber { id, tx });
            *subscribers = Arc::new(next);
        }
        drop(backlog);

        tracing::debug!("Watcher subscriber {} added", id);
        (id, rx)
    }

    /// Drive `sink` from its own task until it fails or is unsubscribed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<S: StateSink>(&self, mut sink: S) -> SubscriberId {
        let (id, mut rx) = self.subscribe_channel();
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.push(event).await {
                    tracing::warn!("Watcher subscriber {} failed, dropping it: {}", id, e);
                    break;
                }
            }
            if let Some(inner) = inner.upgrade() {
                Watcher { inner }.unsubscribe(id);
            }
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.remove(&[id]);
        if removed {
            tracing::debug!("Watcher subscriber {} removed", id);
        }
        removed
    }

    fn remove(&self, ids: &[SubscriberId]) -> bool {
        let mut subscribers = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if !subscribers.iter().any(|s| ids.contains(&s.id)) {
            return false;
        }
        let next: Vec<Subscriber> = subscribers
            .iter()
            .filter(|s| !ids.contains(&s.id))
            .map(|s| Subscriber {
                id: s.id,
                tx: s.tx.clone(),
            })
            .collect();
        *subscribers = Arc::new(next);
        true
    }

    /// Forget the previous run's backlog.
    pub fn start_run(&self, profile: Option<String>) {
        let mut backlog = self.backlog();
        backlog.log.clear();
        backlog.profile = profile;
    }

    pub fn publish(&self, state: Arc<ControlState>) {
        let subscribers = {
            let mut backlog = self.backlog();
            if backlog.log.len() == self.inner.capacity {
                backlog.log.pop_front();
            }
            backlog.log.push_back(state.clone());
            self.registry()
        };
        self.send_all(&subscribers, || WatchEvent::State(state.clone()));
    }

    /// Operator note. Goes to current subscribers only, never the backlog.
    pub fn memo(&self, text: impl Into<String>, at: DateTime<Utc>) {
        let text = text.into();
        let subscribers = self.registry();
        self.send_all(&subscribers, || WatchEvent::Memo {
            text: text.clone(),
            at,
        });
    }

    fn send_all(&self, subscribers: &[Subscriber], event: impl Fn() -> WatchEvent) {
        let mut closed = Vec::new();
        for subscriber in subscribers {
            match subscriber.tx.try_send(event()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Watcher subscriber {} is behind, event dropped",
                        subscriber.id
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }
        if !closed.is_empty() {
            self.remove(&closed);
            tracing::debug!("Watcher pruned {} closed subscribers", closed.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog().log.len()
    }

    /// Events dropped for slow subscribers since creation.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_shared::{Schedule, SinkError, TempScale};

    fn watcher(capacity: usize, buffer: usize) -> Watcher {
        Watcher::new(&WatcherConfig {
            backlog_capacity: capacity,
            subscriber_buffer: buffer,
        })
    }

    fn state(runtime: f64) -> Arc<ControlState> {
        let schedule = Schedule::from_pairs("w", &[(0.0, 70.0), (100.0, 170.0)]).unwrap();
        Arc::new(ControlState::running(schedule, runtime, Utc::now(), TempScale::Fahrenheit))
    }

    fn runtime_of(event: &WatchEvent) -> f64 {
        match event {
            WatchEvent::State(s) => s.virtual_runtime,
            other => panic!("expected state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_bounded_backlog_first() {
        let w = watcher(3, 8);
        w.start_run(Some("w".into()));
        for t in 0..5 {
            w.publish(state(t as f64));
        }
        assert_eq!(w.backlog_len(), 3);

        let (_, mut rx) = w.subscribe_channel();
        match rx.recv().await.unwrap() {
            WatchEvent::Backlog { profile, log } => {
                assert_eq!(profile.as_deref(), Some("w"));
                let runtimes: Vec<f64> = log.iter().map(|s| s.virtual_runtime).collect();
                assert_eq!(runtimes, vec![2.0, 3.0, 4.0]);
            }
            other => panic!("expected backlog, got {:?}", other),
        }
        w.publish(state(5.0));
        assert_eq!(runtime_of(&rx.recv().await.unwrap()), 5.0);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_others() {
        let w = watcher(10, 2);
        let (_, _slow) = w.subscribe_channel();
        let (_, mut fast) = w.subscribe_channel();
        let _ = fast.recv().await;

        for t in 0..5 {
            w.publish(state(t as f64));
            assert_eq!(runtime_of(&fast.recv().await.unwrap()), t as f64);
        }
        // Slow queue held the backlog plus one tick; the rest were dropped.
        assert_eq!(w.dropped_events(), 4);
        assert_eq!(w.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let w = watcher(10, 4);
        let (_, rx) = w.subscribe_channel();
        let (id, _keep) = w.subscribe_channel();
        drop(rx);
        w.publish(state(0.0));
        assert_eq!(w.subscriber_count(), 1);
        assert!(w.unsubscribe(id));
        assert!(!w.unsubscribe(id));
        assert_eq!(w.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn memo_skips_backlog() {
        let w = watcher(10, 4);
        let (_, mut rx) = w.subscribe_channel();
        let _ = rx.recv().await;
        let at = Utc::now() - chrono::Duration::hours(2);
        w.memo("cone 6 down", at);
        match rx.recv().await.unwrap() {
            WatchEvent::Memo { text, at: stamped } => {
                assert_eq!(text, "cone 6 down");
                assert_eq!(stamped, at);
            }
            other => panic!("expected memo, got {:?}", other),
        }
        assert_eq!(w.backlog_len(), 0);
    }

    #[tokio::test]
    async fn new_run_clears_backlog() {
        let w = watcher(10, 4);
        w.publish(state(1.0));
        w.start_run(Some("next".into()));
        assert_eq!(w.backlog_len(), 0);
    }

    struct Collect(tokio::sync::mpsc::UnboundedSender<WatchEvent>);

    #[async_trait]
    impl StateSink for Collect {
        async fn push(&mut self, event: WatchEvent) -> Result<(), SinkError> {
            self.0.send(event).map_err(|_| SinkError::Closed)
        }
    }

    #[tokio::test]
    async fn sink_subscription_forwards_and_cleans_up() {
        let w = watcher(10, 4);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        w.subscribe(Collect(tx));
        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Backlog { .. }));
        w.publish(state(7.0));
        assert_eq!(runtime_of(&rx.recv().await.unwrap()), 7.0);

        // A failing sink removes itself.
        drop(rx);
        w.publish(state(8.0));
        for _ in 0..50 {
            if w.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(w.subscriber_count(), 0);
    }
}
