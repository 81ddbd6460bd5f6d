//! Message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionState;

/// Free-form request payload carried by an envelope. Immutable once
/// dispatched — handlers receive it by value, and any response they
/// produce is a new `Value`, never a mutation of the request.
pub type MessageContext = Value;

/// A message routed through the bus.
///
/// Created at the call site and consumed by the registry; nothing in the
/// envelope is mutated after `MessageBus::dispatch` takes ownership of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub target_agent: String,
    pub action: String,
    pub context: MessageContext,
    pub timestamp: DateTime<Utc>,
    pub source_agent: Option<String>,
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    /// Start a new root-level envelope (no existing correlation id).
    pub fn new(
        target_agent: impl Into<String>,
        action: impl Into<String>,
        context: MessageContext,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            target_agent: target_agent.into(),
            action: action.into(),
            context,
            timestamp: Utc::now(),
            source_agent: None,
            correlation_id: None,
        }
    }

    pub fn from_agent(mut self, source_agent: impl Into<String>) -> Self {
        self.source_agent = Some(source_agent.into());
        self
    }

    /// Nest this envelope under a parent's call — the `correlation_id`
    /// becomes the root envelope's `message_id` if not already set, which is
    /// what gives nested dispatches their ordering guarantee.
    pub fn nested_under(mut self, parent: &MessageEnvelope) -> Self {
        self.correlation_id = Some(
            parent
                .correlation_id
                .clone()
                .unwrap_or_else(|| parent.message_id.clone()),
        );
        self
    }

    pub fn is_root(&self) -> bool {
        self.correlation_id.is_none()
    }
}

/// The context handed to a handler: the caller's free-form payload plus
/// the injected, immutable session snapshot.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub action: String,
    pub context: MessageContext,
    pub session_snapshot: SessionState,
    pub envelope: MessageEnvelope,
}

/// A handler's response payload.
pub type HandlerResponse = Value;
