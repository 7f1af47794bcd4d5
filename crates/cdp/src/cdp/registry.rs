//! Event Registry - method name to ordered handler list

use dashmap::DashMap;
use std::sync::Arc;

use super::protocol::CDPEvent;

/// Event subscriber callback
///
/// Called on tokio's blocking pool, one event at a time, so blocking does not
/// stall command responses. It does hold up later events: they queue without
/// bound until it returns (see `CDPClient::pending_events`). Keep it short;
/// spawn a task for anything that waits.
pub type EventCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    /// Key: method name (e.g., "Page.loadEventFired"), Value: callbacks in registration order
    subscribers: DashMap<String, Vec<EventCallback>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        let method = method.into();
        tracing::debug!(%method, "event handler registered");
        self.subscribers.entry(method).or_default().push(callback);
    }

    /// Handlers registered for `method` right now, in registration order.
    pub fn handlers(&self, method: &str) -> Vec<EventCallback> {
        self.subscribers
            .get(method)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, method: &str) -> usize {
        self.subscribers
            .get(method)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;

    fn event(method: &str) -> CDPEvent {
        CDPEvent {
            method: method.to_string(),
            params: Value::Null,
            session_id: None,
        }
    }

    #[test]
    fn test_handlers_keep_registration_order() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.subscribe(
                "Page.loadEventFired",
                Arc::new(move |_| seen.lock().unwrap().push(tag)),
            );
        }

        for handler in registry.handlers("Page.loadEventFired") {
            handler(event("Page.loadEventFired"));
        }

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unknown_method_has_no_handlers() {
        let registry = EventRegistry::new();
        registry.subscribe("A.x", Arc::new(|_| {}));
        assert!(registry.handlers("A.y").is_empty());
        assert_eq!(registry.handler_count("A.x"), 1);
    }

    #[test]
    fn test_snapshot_ignores_later_registrations() {
        let registry = EventRegistry::new();
        registry.subscribe("A.x", Arc::new(|_| {}));
        let snapshot = registry.handlers("A.x");
        registry.subscribe("A.x", Arc::new(|_| {}));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.handler_count("A.x"), 2);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(EventRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.subscribe("Network.requestWillBeSent", Arc::new(|_| {}));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.handler_count("Network.requestWillBeSent"), 400);
    }
}
