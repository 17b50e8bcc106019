/// Event Bus — in-process publish/subscribe with typed events, wildcard
/// and per-device subscriptions.
///
/// Dispatch order for a single event: wildcard handlers, then typed
/// handlers, then device-filtered handlers; within a group, insertion
/// order. A handler that returns an error is logged and isolated — one
/// bad handler never stops the others. `publish` fires handlers without
/// waiting for them (matching the source's "schedule on the loop and move
/// on" behavior); `publish_async` awaits all of them concurrently.
use airbridge_core::{Event, EventTypeTag};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry {
    wildcard: Vec<(u64, Handler)>,
    typed: HashMap<EventTypeTag, Vec<(u64, Handler)>>,
    device_typed: HashMap<(String, EventTypeTag), Vec<(u64, Handler)>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            wildcard: Vec::new(),
            typed: HashMap::new(),
            device_typed: HashMap::new(),
        }
    }
}

pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to every event regardless of type or device.
    pub fn subscribe_all(&self, handler: Handler) -> SubscriptionId {
        let id = self.alloc_id();
        self.registry.write().unwrap().wildcard.push((id, handler));
        SubscriptionId(id)
    }

    /// Subscribe to one event type, optionally filtered to a device.
    pub fn subscribe(
        &self,
        event_type: EventTypeTag,
        device_id: Option<&str>,
        handler: Handler,
    ) -> SubscriptionId {
        let id = self.alloc_id();
        let mut registry = self.registry.write().unwrap();
        match device_id {
            Some(device_id) => {
                registry
                    .device_typed
                    .entry((device_id.to_string(), event_type))
                    .or_default()
                    .push((id, handler));
            }
            None => {
                registry.typed.entry(event_type).or_default().push((id, handler));
            }
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.write().unwrap();
        registry.wildcard.retain(|(hid, _)| *hid != id.0);
        for handlers in registry.typed.values_mut() {
            handlers.retain(|(hid, _)| *hid != id.0);
        }
        for handlers in registry.device_typed.values_mut() {
            handlers.retain(|(hid, _)| *hid != id.0);
        }
    }

    /// Drop every handler filtered to `device_id` — used on device removal.
    pub fn unsubscribe_device(&self, device_id: &str) {
        let mut registry = self.registry.write().unwrap();
        registry
            .device_typed
            .retain(|(id, _), _| id != device_id);
    }

    fn collect_handlers(&self, event: &Event) -> Vec<Handler> {
        let registry = self.registry.read().unwrap();
        let tag = event.tag();

        let mut handlers: Vec<Handler> = registry
            .wildcard
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        if let Some(typed) = registry.typed.get(&tag) {
            handlers.extend(typed.iter().map(|(_, h)| h.clone()));
        }

        if let Some(device_id) = &event.device_id {
            if let Some(device_typed) = registry.device_typed.get(&(device_id.clone(), tag)) {
                handlers.extend(device_typed.iter().map(|(_, h)| h.clone()));
            }
        }

        handlers
    }

    /// Fire-and-forget fan-out: handlers run on spawned tasks; the caller
    /// does not wait for them to complete.
    pub fn publish(&self, event: Event) {
        for handler in self.collect_handlers(&event) {
            let ev = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(ev).await {
                    warn!(error = %e, "event handler failed");
                }
            });
        }
    }

    /// Awaits all handlers concurrently; a failing or panicking handler
    /// is logged and does not affect the others.
    pub async fn publish_async(&self, event: Event) {
        let handlers = self.collect_handlers(&event);
        let mut joins = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let ev = event.clone();
            joins.push(tokio::spawn(async move { handler(ev).await }));
        }
        for join in joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "event handler failed"),
                Err(e) => warn!(error = %e, "event handler panicked"),
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airbridge_core::EventKind;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn wildcard_handler_receives_every_event() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe_all(counting_handler(counter.clone()));

        bus.publish_async(Event::global(EventKind::Startup)).await;
        bus.publish_async(Event::for_device("dev-1", EventKind::Stop))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn typed_handler_only_receives_matching_type() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventTypeTag::Stop, None, counting_handler(counter.clone()));

        bus.publish_async(Event::global(EventKind::Stop)).await;
        bus.publish_async(Event::global(EventKind::Pause)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_filtered_handler_ignores_other_devices() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventTypeTag::Pause,
            Some("dev-1"),
            counting_handler(counter.clone()),
        );

        bus.publish_async(Event::for_device("dev-2", EventKind::Pause))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        bus.publish_async(Event::for_device("dev-1", EventKind::Pause))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe_all(Arc::new(|_event| Box::pin(async move { anyhow::bail!("boom") })));
        bus.subscribe_all(counting_handler(counter.clone()));

        bus.publish_async(Event::global(EventKind::Startup)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_device_drops_device_filtered_handlers() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventTypeTag::Stop,
            Some("dev-1"),
            counting_handler(counter.clone()),
        );

        bus.unsubscribe_device("dev-1");
        bus.publish_async(Event::for_device("dev-1", EventKind::Stop))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_single_handler() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe_all(counting_handler(counter.clone()));
        bus.unsubscribe(id);

        bus.publish_async(Event::global(EventKind::Startup)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
