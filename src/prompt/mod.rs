//! Prompt Service — versioned templates, rendering, and LLM invocation.

pub mod service;
pub mod template;

pub use service::{LlmPort, PromptService};
pub use template::{PromptTemplate, PromptTemplateStore};
