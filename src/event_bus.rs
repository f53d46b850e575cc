/*
 * Conversation Assistant - Event Bus
 * Copyright (c) 2024 Conversation Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use futures::future::BoxFuture;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::types::{Event, EventType, Role};

/// Async handler invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscription {
    name: String,
    roles: Option<HashSet<Role>>,
    tx: mpsc::UnboundedSender<Event>,
    dispatch: JoinHandle<()>,
}

/// Typed in-process publish/subscribe bus.
///
/// Each subscription owns an unbounded queue drained by a dedicated dispatch
/// task, so events of one type reach a given subscriber in publish order.
/// Handler failures are caught by the dispatch task and re-published as
/// `EventType::Error` events; they never reach the publisher and never affect
/// other subscribers.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    error_tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<Event>();

        let bus = Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            error_tx,
        });

        // Re-publish handler failures without holding a strong cycle.
        let weak: Weak<EventBus> = Arc::downgrade(&bus);
        tokio::spawn(async move {
            while let Some(event) = error_rx.recv().await {
                match weak.upgrade() {
                    Some(bus) => bus.publish(event).await,
                    None => break,
                }
            }
        });

        bus
    }

    /// Register `handler` for `event_type` under `name`.
    ///
    /// The (type, name) pair is the idempotence key: subscribing again with
    /// the same name replaces the previous registration. When `roles` is
    /// provided, only events whose role is unset or in the set are delivered.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        name: &str,
        handler: EventHandler,
        roles: Option<HashSet<Role>>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let error_tx = self.error_tx.clone();
        let handler_name = name.to_string();
        let dispatch = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let original_type = event.event_type;
                if let Err(e) = (handler)(event).await {
                    if original_type == EventType::Error {
                        // A failing error handler is logged, not re-emitted,
                        // so delivery cannot recurse without bound.
                        tracing::warn!(
                            handler = handler_name.as_str(),
                            "error-event handler failed: {e:#}"
                        );
                        continue;
                    }
                    tracing::debug!(
                        handler = handler_name.as_str(),
                        event_type = %original_type,
                        "event handler failed: {e:#}"
                    );
                    let error_event = Event::new(
                        EventType::Error,
                        json!({
                            "status": "handler_failed",
                            "handler": handler_name.as_str(),
                            "original_event": original_type.to_string(),
                            "error": format!("{e:#}"),
                        }),
                    );
                    let _ = error_tx.send(error_event);
                }
            }
        });

        let mut subscribers = self.subscribers.write().await;
        let entries = subscribers.entry(event_type).or_default();
        if let Some(existing) = entries.iter().position(|s| s.name == name) {
            let old = entries.swap_remove(existing);
            old.dispatch.abort();
        }
        entries.push(Subscription {
            name: name.to_string(),
            roles,
            tx,
            dispatch,
        });
    }

    /// Remove the subscription registered under (type, name), if any.
    pub async fn unsubscribe(&self, event_type: EventType, name: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(entries) = subscribers.get_mut(&event_type) {
            if let Some(idx) = entries.iter().position(|s| s.name == name) {
                let sub = entries.remove(idx);
                drop(sub.tx);
                // Let the dispatch task drain its queue and exit on its own.
            }
        }
    }

    /// Publish an event to every current subscriber of its type.
    ///
    /// Completes once the event is handed off to each subscriber's queue; it
    /// does not wait for handlers to run.
    pub async fn publish(&self, event: Event) {
        let subscribers = self.subscribers.read().await;
        let Some(entries) = subscribers.get(&event.event_type) else {
            return;
        };

        for sub in entries {
            if let (Some(role), Some(filter)) = (event.role, sub.roles.as_ref()) {
                if !filter.contains(&role) {
                    continue;
                }
            }
            if sub.tx.send(event.clone()).is_err() {
                tracing::debug!(
                    handler = sub.name.as_str(),
                    "dropping event for dead subscriber"
                );
            }
        }
    }

    /// Number of live subscriptions for a type.
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription. Dispatch tasks exit after draining.
    pub async fn shutdown(&self) {
        self.subscribers.write().await.clear();
    }
}

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    fn collecting_handler(sink: Arc<Mutex<Vec<Event>>>) -> EventHandler {
        handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Transcript,
            "order_check",
            collecting_handler(seen.clone()),
            None,
        )
        .await;

        for i in 0..50 {
            bus.publish(Event::new(EventType::Transcript, json!({"seq": i})))
                .await;
        }

        sleep(Duration::from_millis(50)).await;
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 50);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.data["seq"], json!(i));
        }
    }

    #[tokio::test]
    async fn role_filter_restricts_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Assistance,
            "support_only",
            collecting_handler(seen.clone()),
            Some([Role::Support].into_iter().collect()),
        )
        .await;

        bus.publish(
            Event::new(EventType::Assistance, json!({"n": 1})).with_role(Role::Interviewer),
        )
        .await;
        bus.publish(Event::new(EventType::Assistance, json!({"n": 2})).with_role(Role::Support))
            .await;
        // Unset role is always delivered.
        bus.publish(Event::new(EventType::Assistance, json!({"n": 3})))
            .await;

        sleep(Duration::from_millis(50)).await;
        let events = seen.lock().unwrap();
        let ns: Vec<_> = events.iter().map(|e| e.data["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_event() {
        let bus = EventBus::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Error,
            "error_sink",
            collecting_handler(errors.clone()),
            None,
        )
        .await;
        bus.subscribe(
            EventType::Transcript,
            "failing",
            handler(|_| async { Err(anyhow::anyhow!("boom")) }),
            None,
        )
        .await;

        bus.publish(Event::new(EventType::Transcript, json!({}))).await;

        sleep(Duration::from_millis(100)).await;
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["handler"], json!("failing"));
        assert_eq!(errors[0].data["original_event"], json!("transcript"));
    }

    #[tokio::test]
    async fn resubscribe_same_name_replaces() {
        let bus = EventBus::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            EventType::Metrics,
            "metrics",
            collecting_handler(first.clone()),
            None,
        )
        .await;
        bus.subscribe(
            EventType::Metrics,
            "metrics",
            collecting_handler(second.clone()),
            None,
        )
        .await;
        assert_eq!(bus.subscriber_count(EventType::Metrics).await, 1);

        bus.publish(Event::new(EventType::Metrics, json!({}))).await;
        sleep(Duration::from_millis(50)).await;

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Transcript,
            "failing",
            handler(|_| async { Err(anyhow::anyhow!("boom")) }),
            None,
        )
        .await;
        bus.subscribe(
            EventType::Transcript,
            "healthy",
            collecting_handler(seen.clone()),
            None,
        )
        .await;

        bus.publish(Event::new(EventType::Transcript, json!({"x": 1})))
            .await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
