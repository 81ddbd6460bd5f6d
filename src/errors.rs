//! Structured error taxonomy for the orchestration core.
//!
//! Every error raised inside the core carries the envelope required by the
//! failure semantics: `{timestamp, component, error_code, message,
//! stack_trace, state_snapshot_digest, context}`. Components never swallow
//! exceptions or substitute defaults for missing required inputs; they raise
//! a typed variant here and let it propagate to the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured context carried alongside every raised error.
///
/// `message_id`, `session_id`, and `attempt_number` are present whenever the
/// error originates from a dispatched message; LLM failures additionally
/// carry the provider status and a retry hint, and I/O failures carry the
/// file path and operation, per the failure semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub attempt_number: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_number = Some(attempt);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.extra.insert(key.into(), v);
        }
        self
    }
}

/// The envelope required on every raised error.
///
/// This is the serialized form surfaced to clients and written into the
/// session-scoped failure log; it is deliberately not the `Error` trait
/// object itself so it can outlive the originating error and be
/// round-tripped through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub timestamp: DateTime<Utc>,
    pub component: &'static str,
    pub error_code: &'static str,
    pub message: String,
    pub stack_trace: String,
    pub state_snapshot_digest: Option<String>,
    pub context: ErrorContext,
}

impl ErrorEnvelope {
    pub fn new(
        component: &'static str,
        error_code: &'static str,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            component,
            error_code,
            message: message.into(),
            // `std::backtrace::Backtrace` is intentionally not captured here:
            // the core never panics on these paths, so the best available
            // "stack trace" is the causal chain of the error itself.
            stack_trace: String::new(),
            state_snapshot_digest: None,
            context,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.state_snapshot_digest = Some(digest.into());
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = trace.into();
        self
    }
}

/// Errors raised by the Conversation Agent when caller-supplied
/// metadata is invalid. The *only* handled failures in the taxonomy: these
/// are converted into structured, user-facing re-prompts rather than
/// propagated as fatal errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("required field '{field}' is missing")]
    MissingField { field: String },

    #[error("field '{field}' has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("field '{field}' value '{value}' is not in the approved taxonomy")]
    NotInTaxonomy { field: String, value: String },
}

/// Errors raised by the Conversion Agent when the external
/// conversion library fails. The library's original error text is
/// preserved verbatim.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConversionError {
    #[error("no plausible format interface detected for '{path}'")]
    NoInterfaceDetected { path: String },

    #[error("conversion library failed: {library_error}")]
    LibraryFailed { library_error: String },

    #[error("converted file failed the NWB readability gate: {reason}")]
    UnreadableOutput { reason: String },

    #[error("I/O failure during conversion: {operation} on '{path}': {reason}")]
    Io {
        operation: String,
        path: String,
        reason: String,
    },
}

/// Errors raised by the Evaluation Agent.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EvaluationError {
    #[error("inspector run exceeded the timeout budget")]
    Timeout,

    #[error("NWB file could not be opened: {reason}")]
    UnreadableFile { reason: String },

    #[error("inspector library failed: {library_error}")]
    LibraryFailed { library_error: String },
}

/// Errors raised by the Report Service.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ReportGenerationError {
    #[error("failed to render PDF report: {reason}")]
    PdfRenderFailed { reason: String },

    #[error("failed to render JSON correction context: {reason}")]
    JsonRenderFailed { reason: String },

    #[error("failed to write artifact to '{path}': {reason}")]
    WriteFailed { path: String, reason: String },
}

/// Errors raised by the Prompt Service.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PromptBindingError {
    #[error("unknown prompt template id '{template_id}'")]
    UnknownTemplate { template_id: String },

    #[error("missing required variable '{variable}' for template '{template_id}'")]
    MissingVariable {
        template_id: String,
        variable: String,
    },

    #[error("unexpected variable '{variable}' for template '{template_id}'")]
    UnexpectedVariable {
        template_id: String,
        variable: String,
    },
}

/// The LLM port is required; the core never falls back to heuristic-only
/// operation when it is unavailable.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("LLM provider unavailable: {provider_status} ({diagnostic_id})")]
pub struct LLMUnavailable {
    pub provider_status: String,
    pub retry_hint: Option<String>,
    pub diagnostic_id: String,
}

/// Raised when the LLM responded but the response could not be parsed or
/// failed schema validation against the template's `output_schema`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("LLM response for template '{template_id}' was invalid: {reason}")]
pub struct LLMResponseInvalid {
    pub template_id: String,
    pub reason: String,
    pub raw_response: String,
}

/// Routing failures raised by the Message Bus.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum RoutingError {
    #[error("no agent registered under the name '{agent}'")]
    AgentNotRegistered { agent: String },

    #[error("agent '{agent}' does not support action '{action}'")]
    UnknownAction { agent: String, action: String },

    #[error("handler for '{agent}::{action}' failed: {source_message}")]
    AgentInvocationFailed {
        agent: String,
        action: String,
        source_message: String,
    },
}

/// Raised when an upload is rejected because a session is already in
/// flight.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("a conversion session is already in progress")]
pub struct SessionBusy;

/// Non-fatal advisory surfaced to the user when a new attempt's issue
/// fingerprint matches the previous attempt's.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("no changes detected since last attempt: {detail}")]
pub struct NoProgressWarning {
    pub detail: String,
}

/// Top-level error type the bus and agents propagate. Each variant knows
/// its own component name and error code so `ErrorEnvelope::from` can be
/// constructed uniformly at the boundary where the error is finally
/// reported (the external interface adapter, or a test assertion).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Report(#[from] ReportGenerationError),
    #[error(transparent)]
    PromptBinding(#[from] PromptBindingError),
    #[error(transparent)]
    LlmUnavailable(#[from] LLMUnavailable),
    #[error(transparent)]
    LlmResponseInvalid(#[from] LLMResponseInvalid),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    SessionBusy(#[from] SessionBusy),
}

impl CoreError {
    /// Component name this error originated from, for the error envelope.
    pub fn component(&self) -> &'static str {
        match self {
            Self::Validation(_) => "conversation_agent",
            Self::Conversion(_) => "conversion_agent",
            Self::Evaluation(_) => "evaluation_agent",
            Self::Report(_) => "report_service",
            Self::PromptBinding(_) | Self::LlmUnavailable(_) | Self::LlmResponseInvalid(_) => {
                "prompt_service"
            }
            Self::Routing(_) => "message_bus",
            Self::SessionBusy(_) => "session_store",
        }
    }

    /// Machine-readable error code for the envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => match e {
                ValidationError::MissingField { .. } => "VALIDATION_MISSING_FIELD",
                ValidationError::InvalidFormat { .. } => "VALIDATION_INVALID_FORMAT",
                ValidationError::NotInTaxonomy { .. } => "VALIDATION_NOT_IN_TAXONOMY",
            },
            Self::Conversion(e) => match e {
                ConversionError::NoInterfaceDetected { .. } => "CONVERSION_NO_INTERFACE",
                ConversionError::LibraryFailed { .. } => "CONVERSION_LIBRARY_FAILED",
                ConversionError::UnreadableOutput { .. } => "CONVERSION_UNREADABLE_OUTPUT",
                ConversionError::Io { .. } => "CONVERSION_IO_ERROR",
            },
            Self::Evaluation(e) => match e {
                EvaluationError::Timeout => "EVALUATION_TIMEOUT",
                EvaluationError::UnreadableFile { .. } => "EVALUATION_UNREADABLE_FILE",
                EvaluationError::LibraryFailed { .. } => "EVALUATION_LIBRARY_FAILED",
            },
            Self::Report(e) => match e {
                ReportGenerationError::PdfRenderFailed { .. } => "REPORT_PDF_FAILED",
                ReportGenerationError::JsonRenderFailed { .. } => "REPORT_JSON_FAILED",
                ReportGenerationError::WriteFailed { .. } => "REPORT_WRITE_FAILED",
            },
            Self::PromptBinding(e) => match e {
                PromptBindingError::UnknownTemplate { .. } => "PROMPT_UNKNOWN_TEMPLATE",
                PromptBindingError::MissingVariable { .. } => "PROMPT_MISSING_VARIABLE",
                PromptBindingError::UnexpectedVariable { .. } => "PROMPT_UNEXPECTED_VARIABLE",
            },
            Self::LlmUnavailable(_) => "LLM_UNAVAILABLE",
            Self::LlmResponseInvalid(_) => "LLM_RESPONSE_INVALID",
            Self::Routing(e) => match e {
                RoutingError::AgentNotRegistered { .. } => "AGENT_NOT_REGISTERED",
                RoutingError::UnknownAction { .. } => "UNKNOWN_ACTION",
                RoutingError::AgentInvocationFailed { .. } => "AGENT_INVOCATION_ERROR",
            },
            Self::SessionBusy(_) => "SESSION_BUSY",
        }
    }

    /// Build the full envelope for this error.
    pub fn into_envelope(self, context: ErrorContext) -> ErrorEnvelope {
        let component = self.component();
        let code = self.error_code();
        ErrorEnvelope::new(component, code, self.to_string(), context)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
