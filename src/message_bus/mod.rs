//! Message Bus — MCP-style envelope routing between agents.

pub mod envelope;
pub mod registry;

pub use envelope::{HandlerInvocation, HandlerResponse, MessageContext, MessageEnvelope};
pub use registry::{AgentHandler, DispatchLogEntry, DispatchOutcome, MessageBus};
