//! Per-participant media sessions on the gateway.
//!
//! Each session owns one plugin handle and runs a pump task that turns the
//! handle's [`HandleEvent`](crate::gateway::HandleEvent)s into typed session
//! events. All sessions of one connection feed a single [`SessionEvent`]
//! channel, so the connection actor sees them in arrival order.

pub mod publisher;
pub mod subscriber;

pub use publisher::{PublisherEvent, PublisherSession, PublisherState};
pub use subscriber::{SubscriberEvent, SubscriberSession, SubscriberState};

use crate::errors::SignalingError;
use crate::gateway::protocol::HandleId;
use crate::gateway::GatewaySession;
use common::types::FeedId;
use std::sync::{Arc, Weak};

/// Capacity of a connection's session event channel.
pub const SESSION_EVENT_BUFFER: usize = 128;

/// Event from one of a connection's media sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Publisher(PublisherEvent),
    Subscriber {
        feed_id: FeedId,
        event: SubscriberEvent,
    },
}

/// A plugin handle plus a non-owning reference to the control session it
/// was opened on.
struct Attachment {
    id: HandleId,
    session: Weak<dyn GatewaySession>,
}

impl Attachment {
    fn new(id: HandleId, session: &Arc<dyn GatewaySession>) -> Self {
        Self {
            id,
            session: Arc::downgrade(session),
        }
    }

    fn session(&self) -> Result<Arc<dyn GatewaySession>, SignalingError> {
        self.session.upgrade().ok_or_else(|| {
            SignalingError::GatewayUnreachable("gateway session is gone".to_string())
        })
    }
}
