//! Events and the bus that carries them

mod bus;
mod types;

pub use bus::{
    BusStats, EVENTS_STREAM, EventBus, EventHandler, EventPublisher, EventSubscriber, SubscriptionHandle, handler_fn,
};
pub use types::{
    DECISION_ID_KEY, Event, EventKind, INSTANCE_ID_KEY, Payload, REASON_KEY, REQUEST_ID_KEY, STATUS_KEY, Verdict,
    WILDCARD,
};
