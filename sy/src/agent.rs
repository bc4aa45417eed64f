//! AgentClient - the contract agents use to talk to the fleet
//!
//! Agents never see the bus itself, only the publish/subscribe capabilities
//! it implements.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::ValidationError;
use crate::events::{Event, EventPublisher, EventSubscriber, SubscriptionHandle, handler_fn};

#[derive(Clone)]
pub struct AgentClient {
    agent_id: String,
    publisher: Arc<dyn EventPublisher>,
    subscriber: Arc<dyn EventSubscriber>,
}

impl AgentClient {
    pub fn new(
        agent_id: impl Into<String>,
        publisher: Arc<dyn EventPublisher>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            publisher,
            subscriber,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Publish an event with this agent as its source
    ///
    /// `data` must be a JSON object or null.
    pub fn publish_agent_event(
        &self,
        event_type: &str,
        data: Value,
        request_id: Option<String>,
    ) -> Result<(), ValidationError> {
        debug!(agent = %self.agent_id, %event_type, "AgentClient::publish_agent_event: called");
        let mut event = Event::from_value(event_type, &self.agent_id, data)?;
        if let Some(request_id) = request_id {
            event = event.with_request_id(request_id);
        }
        self.publisher.publish(event)
    }

    /// Run `callback` for every event of `event_type`
    pub fn subscribe_to_event<F, Fut>(&self, event_type: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        debug!(agent = %self.agent_id, %event_type, "AgentClient::subscribe_to_event: called");
        self.subscriber.subscribe_handler(event_type, handler_fn(callback))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriber.unsubscribe(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::events::EventBus;
    use serde_json::json;
    use std::sync::Mutex;

    fn client(bus: &Arc<EventBus>, id: &str) -> AgentClient {
        AgentClient::new(id, bus.clone(), bus.clone())
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = Arc::new(EventBus::new(&BusConfig::default()));
        let builder = client(&bus, "builder");
        let watcher = client(&bus, "watcher");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.subscribe_to_event("build_completed", move |event: Arc<Event>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((event.source.clone(), event.request_id.clone()));
                Ok(())
            }
        });

        builder
            .publish_agent_event("build_completed", json!({"status": "completed"}), Some("r-9".to_string()))
            .unwrap();
        bus.wait_idle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("builder".to_string(), Some("r-9".to_string()))]);
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let bus = Arc::new(EventBus::new(&BusConfig::default()));
        let agent = client(&bus, "builder");

        let err = agent.publish_agent_event("build_completed", json!({}), None).unwrap_err();
        assert!(matches!(err, ValidationError::MissingStatus { .. }));
        assert!(agent.publish_agent_event("x", json!([1, 2]), None).is_err());
        assert_eq!(bus.stats().published, 0);
    }
}
