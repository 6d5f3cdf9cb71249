use crate::events::Event;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub type Subscription = mpsc::UnboundedReceiver<Event>;

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    /// `*` matches everything, `job:*` matches a namespace, anything else
    /// must match the event name exactly.
    fn matches(&self, name: &str) -> bool {
        if self.pattern == "*" {
            return true;
        }
        match self.pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => self.pattern == name,
        }
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    delivered_keys: Mutex<HashSet<String>>,
}

/// In-process publish/subscribe for [`Event`]s.
///
/// Each subscriber owns an unbounded channel, so `emit` never blocks and
/// events reach every subscriber in emission order. Cloning the bus shares
/// the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events whose name matches `pattern`.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber {
            pattern: pattern.into(),
            tx,
        });
        rx
    }

    /// Deliver `event` to every matching subscriber. Returns how many
    /// received it. Closed subscriptions are pruned.
    pub fn emit(&self, event: Event) -> usize {
        let name = event.name();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.matches(name)) {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(event = name, job_id = %event.job_id, delivered, "Event emitted");
        delivered
    }

    /// Emit `event` only the first time `key` is seen. Returns whether the
    /// event was emitted.
    pub fn emit_idempotent(&self, key: impl Into<String>, event: Event) -> bool {
        let key = key.into();
        if !self.inner.delivered_keys.lock().insert(key.clone()) {
            debug!(key = %key, "Duplicate event suppressed");
            return false;
        }
        self.emit(event);
        true
    }

    /// Whether `key` has already gone through [`emit_idempotent`](Self::emit_idempotent).
    pub fn seen(&self, key: &str) -> bool {
        self.inner.delivered_keys.lock().contains(key)
    }

    /// Forget idempotency keys starting with `prefix`, e.g. a finished job's id.
    pub fn forget_keys(&self, prefix: &str) {
        self.inner
            .delivered_keys
            .lock()
            .retain(|key| !key.starts_with(prefix));
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn created(job: &str) -> Event {
        Event::new(job, EventKind::JobCreated)
    }

    fn task_error(job: &str) -> Event {
        Event::new(
            job,
            EventKind::TaskError {
                task_id: "t1".into(),
                error: "boom".into(),
            },
        )
    }

    #[test]
    fn test_pattern_matching() {
        let bus = EventBus::new();
        let mut all = bus.subscribe("*");
        let mut jobs = bus.subscribe("job:*");
        let mut exact = bus.subscribe("task:error");

        assert_eq!(bus.emit(created("j1")), 2);
        assert_eq!(bus.emit(task_error("j1")), 2);

        assert_eq!(all.try_recv().unwrap().name(), "job:created");
        assert_eq!(all.try_recv().unwrap().name(), "task:error");
        assert_eq!(jobs.try_recv().unwrap().name(), "job:created");
        assert!(jobs.try_recv().is_err());
        assert_eq!(exact.try_recv().unwrap().name(), "task:error");
        assert!(exact.try_recv().is_err());
    }

    #[test]
    fn test_emit_idempotent_delivers_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("*");

        assert!(bus.emit_idempotent("j1:t1:error", task_error("j1")));
        assert!(!bus.emit_idempotent("j1:t1:error", task_error("j1")));
        assert!(bus.seen("j1:t1:error"));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forget_keys_by_prefix() {
        let bus = EventBus::new();
        bus.emit_idempotent("j1:t1:done", created("j1"));
        bus.emit_idempotent("j2:t1:done", created("j2"));
        bus.forget_keys("j1:");
        assert!(!bus.seen("j1:t1:done"));
        assert!(bus.seen("j2:t1:done"));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("*");
        let _keep = bus.subscribe("job:*");
        drop(rx);
        assert_eq!(bus.emit(created("j1")), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
