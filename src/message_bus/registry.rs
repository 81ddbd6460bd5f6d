//! Agent registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::envelope::{HandlerInvocation, HandlerResponse, MessageEnvelope};
use crate::errors::{CoreError, RoutingError};
use crate::session::SharedSessionStore;

/// An agent handler: a named function `(action, context, session_snapshot)
/// -> response`. Each handler declares its own legal action set so
/// `UnknownAction` is a lookup against real data rather than a string
/// comparison duplicated at every call site — the design notes ask
/// for exactly this: prefer a small enumeration of legal actions per
/// agent over purely stringly-typed dispatch, while keeping the
/// envelope's wire format string-based for the external interface.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Stable name this handler is registered under.
    fn name(&self) -> &'static str;

    /// The actions this handler accepts.
    fn actions(&self) -> &'static [&'static str];

    /// Handle one invocation. Implementations raise rather than recover;
    /// the only errors converted into non-fatal responses are the
    /// conversation agent's own metadata validation errors.
    async fn handle(&self, invocation: HandlerInvocation) -> Result<HandlerResponse, CoreError>;
}

/// One structured log entry recorded per dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchLogEntry {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub sender: Option<String>,
    pub receiver: String,
    pub action: String,
    pub duration_ms: u64,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Ok,
    Err,
}

/// The message bus: a map from `target_agent` to its handler, plus the
/// single dispatch lane that serializes handler invocation for the
/// session — messages dispatched through the bus execute in strict
/// sequence.
pub struct MessageBus {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
    session_store: SharedSessionStore,
    /// Held for the duration of a *root* dispatch only; nested dispatches
    /// (those carrying a `correlation_id` already) skip acquiring it,
    /// since they run on the same await chain as their root caller and
    /// re-acquiring would deadlock against a non-reentrant lock.
    root_lane: Mutex<()>,
    dispatch_log: Mutex<Vec<DispatchLogEntry>>,
}

impl MessageBus {
    pub fn new(session_store: SharedSessionStore) -> Self {
        Self {
            handlers: HashMap::new(),
            session_store,
            root_lane: Mutex::new(()),
            dispatch_log: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn unregister(&mut self, name: &str) {
        self.handlers.remove(name);
    }

    pub fn list_agents(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub async fn dispatch_log(&self) -> Vec<DispatchLogEntry> {
        self.dispatch_log.lock().await.clone()
    }

    /// Route one envelope to its target handler.
    pub async fn dispatch(&self, envelope: MessageEnvelope) -> Result<HandlerResponse, CoreError> {
        let is_root = envelope.is_root();
        let _root_guard = if is_root {
            Some(self.root_lane.lock().await)
        } else {
            None
        };
        self.dispatch_locked(envelope).await
    }

    async fn dispatch_locked(
        &self,
        envelope: MessageEnvelope,
    ) -> Result<HandlerResponse, CoreError> {
        let started = Instant::now();

        let handler = match self.handlers.get(&envelope.target_agent) {
            Some(h) => h.clone(),
            None => {
                let err = RoutingError::AgentNotRegistered {
                    agent: envelope.target_agent.clone(),
                };
                self.log_dispatch(&envelope, started, DispatchOutcome::Err)
                    .await;
                return Err(err.into());
            }
        };

        if !handler.actions().contains(&envelope.action.as_str()) {
            let err = RoutingError::UnknownAction {
                agent: envelope.target_agent.clone(),
                action: envelope.action.clone(),
            };
            self.log_dispatch(&envelope, started, DispatchOutcome::Err)
                .await;
            return Err(err.into());
        }

        let session_snapshot = self.session_store.get_snapshot().await;
        let invocation = HandlerInvocation {
            action: envelope.action.clone(),
            context: envelope.context.clone(),
            session_snapshot,
            envelope: envelope.clone(),
        };

        let result = handler.handle(invocation).await;

        let outcome = if result.is_ok() {
            DispatchOutcome::Ok
        } else {
            DispatchOutcome::Err
        };
        self.log_dispatch(&envelope, started, outcome).await;

        result.map_err(|err| match &err {
            CoreError::Routing(_) => err,
            other => {
                let wrapped = RoutingError::AgentInvocationFailed {
                    agent: envelope.target_agent.clone(),
                    action: envelope.action.clone(),
                    source_message: other.to_string(),
                };
                wrapped.into()
            }
        })
    }

    async fn log_dispatch(
        &self,
        envelope: &MessageEnvelope,
        started: Instant,
        outcome: DispatchOutcome,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let entry = DispatchLogEntry {
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            sender: envelope.source_agent.clone(),
            receiver: envelope.target_agent.clone(),
            action: envelope.action.clone(),
            duration_ms,
            outcome,
        };
        match outcome {
            DispatchOutcome::Ok => info!(
                receiver = %entry.receiver,
                action = %entry.action,
                message_id = %entry.message_id,
                duration_ms,
                "dispatch completed"
            ),
            DispatchOutcome::Err => warn!(
                receiver = %entry.receiver,
                action = %entry.action,
                message_id = %entry.message_id,
                duration_ms,
                "dispatch failed"
            ),
        }
        self.dispatch_log.lock().await.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl AgentHandler for EchoAgent {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn actions(&self) -> &'static [&'static str] {
            &["say"]
        }

        async fn handle(
            &self,
            invocation: HandlerInvocation,
        ) -> Result<HandlerResponse, CoreError> {
            Ok(invocation.context)
        }
    }

    fn bus_with_echo() -> MessageBus {
        let store = SessionStore::new().shared();
        let mut bus = MessageBus::new(store);
        bus.register(Arc::new(EchoAgent));
        bus
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let bus = bus_with_echo();
        let envelope = MessageEnvelope::new("echo", "say", json!({"text": "hi"}));
        let response = bus.dispatch(envelope).await.unwrap();
        assert_eq!(response["text"], "hi");
    }

    #[tokio::test]
    async fn dispatch_unknown_agent_errors() {
        let bus = bus_with_echo();
        let envelope = MessageEnvelope::new("nobody", "say", json!({}));
        let err = bus.dispatch(envelope).await.unwrap_err();
        assert!(matches!(err, CoreError::Routing(RoutingError::AgentNotRegistered { .. })));
    }

    #[tokio::test]
    async fn dispatch_unknown_action_errors() {
        let bus = bus_with_echo();
        let envelope = MessageEnvelope::new("echo", "shout", json!({}));
        let err = bus.dispatch(envelope).await.unwrap_err();
        assert!(matches!(err, CoreError::Routing(RoutingError::UnknownAction { .. })));
    }

    #[tokio::test]
    async fn nested_dispatch_does_not_deadlock() {
        struct Caller {
            bus: std::sync::Weak<MessageBus>,
        }

        #[async_trait]
        impl AgentHandler for Caller {
            fn name(&self) -> &'static str {
                "caller"
            }
            fn actions(&self) -> &'static [&'static str] {
                &["forward"]
            }
            async fn handle(
                &self,
                invocation: HandlerInvocation,
            ) -> Result<HandlerResponse, CoreError> {
                let nested = MessageEnvelope::new("echo", "say", json!({"nested": true}))
                    .nested_under(&invocation.envelope);
                self.bus.upgrade().unwrap().dispatch(nested).await
            }
        }

        let bus = Arc::new_cyclic(|weak| {
            let mut bus = MessageBus::new(SessionStore::new().shared());
            bus.register(Arc::new(EchoAgent));
            bus.register(Arc::new(Caller { bus: weak.clone() }));
            bus
        });

        let envelope = MessageEnvelope::new("caller", "forward", json!({}));
        let response = bus.dispatch(envelope).await.unwrap();
        assert_eq!(response["nested"], true);
    }
}
