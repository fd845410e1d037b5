//! Event bus attached to every property holder.
//!
//! Handlers register against an event name or a wildcard pattern
//! (`property-set:*`). Post events run handlers in registration order and
//! collect their returned values; pre events run in reverse order and the
//! first error vetoes the operation. Both sync and async handlers are
//! accepted; firing an async handler from the sync path is refused rather
//! than silently skipped.

use crate::{QubesError, QubesResult};
use futures::future::BoxFuture;
use log::error;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// A named event with string keyword arguments.
///
/// Values are kept as strings so that any event can be relayed verbatim
/// onto the admin event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub kwargs: BTreeMap<String, String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(|s| s.as_str())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.kwargs {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

pub type SyncHandler = Arc<dyn Fn(&Event) -> QubesResult<Vec<String>> + Send + Sync>;
pub type AsyncHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, QubesResult<Vec<String>>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Registration {
    id: u64,
    pattern: String,
    handler: Handler,
}

/// Opaque handle for removing a previously added handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Returns true when `pattern` matches `name`. A trailing `*` matches any
/// suffix, so `property-set:*` matches every property-set event.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, pattern: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> QubesResult<Vec<String>> + Send + Sync + 'static,
    {
        self.register(pattern.into(), Handler::Sync(Arc::new(handler)))
    }

    pub fn on_async<F>(&self, pattern: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Event) -> BoxFuture<'static, QubesResult<Vec<String>>> + Send + Sync + 'static,
    {
        self.register(pattern.into(), Handler::Async(Arc::new(handler)))
    }

    fn register(&self, pattern: String, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        handlers.push(Registration {
            id,
            pattern,
            handler,
        });
        HandlerId(id)
    }

    pub fn off(&self, id: HandlerId) {
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        handlers.retain(|r| r.id != id.0);
    }

    fn matching(&self, name: &str) -> Vec<Registration> {
        let handlers = self.handlers.read().expect("event bus lock poisoned");
        handlers
            .iter()
            .filter(|r| pattern_matches(&r.pattern, name))
            .cloned()
            .collect()
    }

    /// Fire a post event. Handler return values are flattened into one
    /// list; handler errors are logged and do not stop delivery.
    ///
    /// Fails if an async handler is registered for this event; the caller
    /// must use [`EventBus::fire_async`] instead.
    pub fn fire(&self, event: &Event) -> QubesResult<Vec<String>> {
        let mut collected = Vec::new();
        for reg in self.matching(&event.name) {
            match reg.handler {
                Handler::Sync(h) => match h(event) {
                    Ok(values) => collected.extend(values),
                    Err(e) => error!("handler for {} failed: {}", event.name, e),
                },
                Handler::Async(_) => {
                    return Err(QubesError::internal(format!(
                        "async handler registered for {} fired synchronously",
                        event.name
                    )));
                }
            }
        }
        Ok(collected)
    }

    /// Fire a pre event. Handlers run in reverse registration order and the
    /// first error vetoes the operation.
    pub fn fire_pre(&self, event: &Event) -> QubesResult<()> {
        for reg in self.matching(&event.name).into_iter().rev() {
            match reg.handler {
                Handler::Sync(h) => {
                    h(event)?;
                }
                Handler::Async(_) => {
                    return Err(QubesError::internal(format!(
                        "async handler registered for {} fired synchronously",
                        event.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Async variant of [`EventBus::fire`]. Sync handlers run inline, async
    /// handlers are awaited in registration order.
    pub async fn fire_async(&self, event: &Event) -> QubesResult<Vec<String>> {
        let mut collected = Vec::new();
        for reg in self.matching(&event.name) {
            let result = match reg.handler {
                Handler::Sync(h) => h(event),
                Handler::Async(h) => h(event.clone()).await,
            };
            match result {
                Ok(values) => collected.extend(values),
                Err(e) => error!("handler for {} failed: {}", event.name, e),
            }
        }
        Ok(collected)
    }

    /// Async variant of [`EventBus::fire_pre`].
    pub async fn fire_pre_async(&self, event: &Event) -> QubesResult<()> {
        for reg in self.matching(&event.name).into_iter().rev() {
            match reg.handler {
                Handler::Sync(h) => {
                    h(event)?;
                }
                Handler::Async(h) => {
                    h(event.clone()).await?;
                }
            }
        }
        Ok(())
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.matching(name).len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("handlers", &count).finish()
    }
}

/// An event paired with the name of the object it happened to, as relayed
/// to admin event stream subscribers.
#[derive(Debug, Clone)]
pub struct RelayedEvent {
    pub subject: String,
    pub event: Event,
}

/// Fan-out channel feeding `admin.Events` subscribers.
///
/// Each subscriber gets a bounded queue; a subscriber that falls behind
/// observes a lag error and its stream is closed by the server.
#[derive(Clone)]
pub struct EventRelay {
    tx: broadcast::Sender<RelayedEvent>,
}

impl EventRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, subject: impl Into<String>, event: Event) {
        // no subscribers is fine
        let _ = self.tx.send(RelayedEvent {
            subject: subject.into(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayedEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn patterns() {
        assert!(pattern_matches("domain-start", "domain-start"));
        assert!(pattern_matches("property-set:*", "property-set:netvm"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("property-set:netvm", "property-set:label"));
    }

    #[test]
    fn fire_collects_in_order() {
        let bus = EventBus::new();
        bus.on("test", |_| Ok(vec!["a".into()]));
        bus.on("test", |_| Ok(vec!["b".into(), "c".into()]));
        bus.on("other", |_| Ok(vec!["nope".into()]));

        let got = bus.fire(&Event::new("test")).unwrap();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn fire_pre_vetoes_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let bus = EventBus::new();
        let o = order.clone();
        bus.on("pre", move |_| {
            o.lock().unwrap().push(1);
            Ok(vec![])
        });
        let o = order.clone();
        bus.on("pre", move |_| {
            o.lock().unwrap().push(2);
            Err(QubesError::invalid_value("vetoed"))
        });

        let err = bus.fire_pre(&Event::new("pre")).unwrap_err();
        assert!(matches!(err, QubesError::InvalidValue { .. }));
        // handler 2 runs first and vetoes before handler 1 is reached
        assert_eq!(*order.lock().unwrap(), vec![2]);
    }

    #[test]
    fn sync_fire_refuses_async_handlers() {
        let bus = EventBus::new();
        bus.on_async("test", |_| Box::pin(async { Ok(vec![]) }));
        assert!(bus.fire(&Event::new("test")).is_err());
    }

    #[tokio::test]
    async fn async_fire_runs_both_kinds() {
        let bus = EventBus::new();
        bus.on("test", |_| Ok(vec!["sync".into()]));
        bus.on_async("test", |_| Box::pin(async { Ok(vec!["async".into()]) }));

        let got = bus.fire_async(&Event::new("test")).await.unwrap();
        assert_eq!(got, vec!["sync", "async"]);
    }

    #[test]
    fn off_removes_handler() {
        let bus = EventBus::new();
        let id = bus.on("test", |_| Ok(vec!["x".into()]));
        assert_eq!(bus.handler_count("test"), 1);
        bus.off(id);
        assert_eq!(bus.handler_count("test"), 0);
    }

    #[test]
    fn n_fires_observe_n_invocations() {
        let count = Arc::new(Mutex::new(0u32));
        let bus = EventBus::new();
        let c = count.clone();
        bus.on("tick", move |_| {
            *c.lock().unwrap() += 1;
            Ok(vec![])
        });
        for _ in 0..5 {
            bus.fire(&Event::new("tick")).unwrap();
        }
        assert_eq!(*count.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn relay_delivers_in_order() {
        let relay = EventRelay::new(16);
        let mut rx = relay.subscribe();
        relay.publish("work", Event::new("domain-start"));
        relay.publish("work", Event::new("domain-started"));

        assert_eq!(rx.recv().await.unwrap().event.name, "domain-start");
        assert_eq!(rx.recv().await.unwrap().event.name, "domain-started");
    }
}
