//! Turns heterogeneous neurophysiology recordings into validated NWB files,
//! with an LLM-assisted correction loop for issues a user can fix.

pub mod adapter;
pub mod agents;
pub mod config;
pub mod errors;
pub mod external;
pub mod llm;
pub mod message_bus;
pub mod prompt;
pub mod report;
pub mod session;
pub mod validation;

// Re-export configuration types
pub use config::{Args, Config, ConfigError};

// Re-export error taxonomy
pub use errors::{
    ConversionError, CoreError, CoreResult, ErrorContext, ErrorEnvelope, EvaluationError,
    LLMResponseInvalid, LLMUnavailable, NoProgressWarning, PromptBindingError,
    ReportGenerationError, RoutingError, SessionBusy, ValidationError,
};

// Re-export session state types
pub use session::{
    AttemptSummary, LogEntry, SessionId, SessionState, SessionStatus, SharedSessionStore, Stage,
    StageName, StageStatus, SessionStore, UserMetadata, ValidationStatus,
};

// Re-export message bus types
pub use message_bus::{
    AgentHandler, DispatchLogEntry, DispatchOutcome, HandlerInvocation, HandlerResponse,
    MessageBus, MessageContext, MessageEnvelope,
};

// Re-export validation and correction types
pub use validation::{
    classify_issue, fingerprint_of, AutoFixRule, CorrectionContext, EstimatedEffort, FileInfo,
    FixStrategy, IssueFingerprint, NoProgressGuard, OverallStatus, Severity, ValidationIssue,
    ValidationResult, AUTO_FIX_RULES,
};

// Re-export prompt pipeline types
pub use prompt::{LlmPort, PromptService, PromptTemplate, PromptTemplateStore};

// Re-export report types
pub use report::{
    build_correction_document, render_passed_pdf, write_correction_document,
    CorrectionReportDocument, LlmCorrectionAnalysis, LlmQualityAnalysis, RenderedArtifact,
    ReportService,
};

// Re-export external library ports
pub use external::{
    ConversionLibraryPort, ConversionOutcome, ExtractedTechnicalMetadata, InterfaceCandidate,
    MockConversionLibrary, MockNwbLibrary, NwbLibraryPort,
};

// Re-export agents
pub use agents::{ConversationAgent, ConversionAgent, EvaluationAgent};

// Re-export the LLM client
pub use llm::AnthropicLlmClient;

// Re-export the external interface adapter
pub use adapter::OrchestratorServer;
