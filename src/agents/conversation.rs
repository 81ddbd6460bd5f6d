//! Conversation Agent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::metadata::{validate_required_metadata, validate_single_field};
use crate::errors::{CoreError, ValidationError};
use crate::message_bus::{AgentHandler, HandlerInvocation, HandlerResponse};
use crate::prompt::PromptService;
use crate::session::{SessionStore, UserMetadata, ValidationStatus};
use crate::validation::{CorrectionContext, NoProgressGuard};

pub const AGENT_NAME: &str = "conversation";
const ACTIONS: &[&str] = &[
    "validate_initial_metadata",
    "handle_evaluation_outcome",
    "receive_user_decision",
    "receive_user_input",
    "abandon_input",
    "finalize",
];

/// What the agent asks the user to choose between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// `PASSED_WITH_ISSUES`: "Improve File" vs "Accept As-Is".
    ImproveOrAccept,
    /// `FAILED`: "Approve Retry" vs "Decline Retry".
    ApproveOrDecline,
}

/// The user-facing prompt built from a `CorrectionContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcomePresentation {
    pub decision_kind: DecisionKind,
    pub summary: String,
    pub categorized_issues: serde_json::Value,
    pub attempt_number: u32,
    pub no_progress_warning: Option<String>,
}

/// Conversation Agent: the only agent that talks to the user.
pub struct ConversationAgent {
    session_store: Arc<SessionStore>,
    prompts: Arc<PromptService>,
    no_progress_guard: tokio::sync::Mutex<NoProgressGuard>,
}

impl ConversationAgent {
    pub fn new(session_store: Arc<SessionStore>, prompts: Arc<PromptService>) -> Self {
        Self {
            session_store,
            prompts,
            no_progress_guard: tokio::sync::Mutex::new(NoProgressGuard::new()),
        }
    }

    /// Mirrors the Conversion Agent's metadata checks from the user-facing side.
    /// Rejected uploads never flip `status` away
    /// from `idle` — the caller must not call `SessionStore::begin` until
    /// this returns `Ok`.
    async fn validate_initial_metadata(
        &self,
        request: ValidateInitialMetadataRequest,
    ) -> Result<UserMetadata, ValidationError> {
        validate_required_metadata(&request.metadata)
    }

    /// Build the user-facing presentation for a `CorrectionContext`, or
    /// finalize immediately if the result was a clean `PASSED`.
    async fn handle_evaluation_outcome(
        &self,
        request: HandleEvaluationOutcomeRequest,
    ) -> Result<HandleEvaluationOutcomeResponse, CoreError> {
        let Some(context) = request.correction_context else {
            // PASSED: no issues at all. Finalize immediately, no correction loop.
            // A clean pass reached after at least one prior attempt is an
            // improvement, not a first-try pass.
            let attempt_number = self.session_store.get_snapshot().await.attempt_number;
            let validation_status = if attempt_number > 0 {
                ValidationStatus::PassedImproved
            } else {
                ValidationStatus::Passed
            };
            self.session_store.set_validation(validation_status).await;
            self.session_store
                .record_attempt(0, 0, None)
                .await;
            self.session_store
                .finalize(crate::session::SessionStatus::Completed)
                .await;
            return Ok(HandleEvaluationOutcomeResponse {
                finalized: true,
                presentation: None,
            });
        };

        let decision_kind = if context.validation_result.overall_status
            == crate::validation::OverallStatus::PassedWithIssues
        {
            DecisionKind::ImproveOrAccept
        } else {
            DecisionKind::ApproveOrDecline
        };

        let no_progress_warning = self.no_progress_guard.lock().await.check(&context);

        self.session_store.set_awaiting_decision(true).await;

        let summary = format!(
            "Attempt {} finished with {} issue(s).",
            context.attempt_number,
            context.validation_result.issues.len()
        );

        Ok(HandleEvaluationOutcomeResponse {
            finalized: false,
            presentation: Some(EvaluationOutcomePresentation {
                decision_kind,
                summary,
                categorized_issues: json!({
                    "auto_fixable": context.auto_fixable_issues,
                    "user_input_required": context.user_input_required_issues,
                }),
                attempt_number: context.attempt_number,
                no_progress_warning,
            }),
        })
    }

    /// Record the user's decision (the agent waits indefinitely and logs every
    /// decision) and resolve it to the next action.
    async fn receive_user_decision(
        &self,
        request: ReceiveUserDecisionRequest,
    ) -> Result<ReceiveUserDecisionResponse, CoreError> {
        self.session_store.set_awaiting_decision(false).await;

        match request.decision_kind {
            DecisionKind::ImproveOrAccept => {
                if request.accept_as_is.unwrap_or(false) {
                    self.session_store
                        .record_attempt(
                            request.issues_before,
                            request.issues_before,
                            Some("accept_as_is".to_string()),
                        )
                        .await;
                    self.session_store
                        .set_validation(ValidationStatus::PassedAccepted)
                        .await;
                    self.session_store
                        .finalize(crate::session::SessionStatus::Completed)
                        .await;
                    Ok(ReceiveUserDecisionResponse::Finalized)
                } else {
                    Ok(ReceiveUserDecisionResponse::ProceedToRetry)
                }
            }
            DecisionKind::ApproveOrDecline => {
                if request.approved {
                    Ok(ReceiveUserDecisionResponse::ProceedToRetry)
                } else {
                    self.session_store
                        .record_attempt(
                            request.issues_before,
                            request.issues_before,
                            Some("declined".to_string()),
                        )
                        .await;
                    self.session_store
                        .set_validation(ValidationStatus::FailedUserDeclined)
                        .await;
                    self.session_store
                        .finalize(crate::session::SessionStatus::Failed)
                        .await;
                    Ok(ReceiveUserDecisionResponse::Finalized)
                }
            }
        }
    }

    /// Validate one user-supplied field, re-prompting on invalid input.
    /// Returns the rendered re-prompt text from the `correction_user_prompt`
    /// template on rejection.
    async fn receive_user_input(
        &self,
        request: ReceiveUserInputRequest,
    ) -> Result<ReceiveUserInputResponse, CoreError> {
        match validate_single_field(&request.field_name, &request.value) {
            Ok(()) => {
                self.no_progress_guard.lock().await.note_user_input_supplied();
                Ok(ReceiveUserInputResponse::Accepted)
            }
            Err(validation_error) => {
                let mut variables = HashMap::new();
                variables.insert("field_name".to_string(), json!(request.field_name));
                variables.insert(
                    "issue_message".to_string(),
                    json!(validation_error.to_string()),
                );
                let reprompt = self.prompts.invoke("correction_user_prompt", &variables).await?;
                Ok(ReceiveUserInputResponse::Rejected { reprompt })
            }
        }
    }

    /// The user abandons a pending input request instead of supplying a
    /// value. The only other cancellation transition besides a declined
    /// retry — finalizes `failed`/`failed_user_abandoned` immediately.
    async fn abandon_input(&self) -> Result<(), CoreError> {
        self.session_store.set_awaiting_input(Vec::new()).await;
        self.session_store
            .set_validation(ValidationStatus::FailedUserAbandoned)
            .await;
        self.session_store
            .finalize(crate::session::SessionStatus::Failed)
            .await;
        Ok(())
    }

    /// Mark the session `completed`/`failed` with the correct terminal
    /// `validation_status`.
    async fn finalize(&self, request: FinalizeRequest) -> Result<(), CoreError> {
        self.session_store.set_validation(request.validation_status).await;
        let terminal_status = match request.validation_status {
            ValidationStatus::Passed
            | ValidationStatus::PassedAccepted
            | ValidationStatus::PassedImproved => crate::session::SessionStatus::Completed,
            _ => crate::session::SessionStatus::Failed,
        };
        self.session_store.finalize(terminal_status).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateInitialMetadataRequest {
    pub metadata: UserMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleEvaluationOutcomeRequest {
    pub correction_context: Option<CorrectionContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleEvaluationOutcomeResponse {
    pub finalized: bool,
    pub presentation: Option<EvaluationOutcomePresentation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveUserDecisionRequest {
    pub decision_kind: DecisionKind,
    pub approved: bool,
    pub accept_as_is: Option<bool>,
    pub issues_before: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiveUserDecisionResponse {
    Finalized,
    ProceedToRetry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveUserInputRequest {
    pub field_name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiveUserInputResponse {
    Accepted,
    Rejected { reprompt: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub validation_status: ValidationStatus,
}

#[async_trait]
impl AgentHandler for ConversationAgent {
    fn name(&self) -> &'static str {
        AGENT_NAME
    }

    fn actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn handle(&self, invocation: HandlerInvocation) -> Result<HandlerResponse, CoreError> {
        match invocation.action.as_str() {
            "validate_initial_metadata" => {
                let request: ValidateInitialMetadataRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "request".to_string(),
                        reason: e.to_string(),
                    })?;
                let metadata = self.validate_initial_metadata(request).await?;
                Ok(serde_json::to_value(metadata).unwrap_or_default())
            }
            "handle_evaluation_outcome" => {
                let request: HandleEvaluationOutcomeRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "request".to_string(),
                        reason: e.to_string(),
                    })?;
                let response = self.handle_evaluation_outcome(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            "receive_user_decision" => {
                let request: ReceiveUserDecisionRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "request".to_string(),
                        reason: e.to_string(),
                    })?;
                let response = self.receive_user_decision(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            "receive_user_input" => {
                let request: ReceiveUserInputRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "request".to_string(),
                        reason: e.to_string(),
                    })?;
                let response = self.receive_user_input(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            "abandon_input" => {
                self.abandon_input().await?;
                Ok(json!({"ok": true}))
            }
            "finalize" => {
                let request: FinalizeRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "request".to_string(),
                        reason: e.to_string(),
                    })?;
                self.finalize(request).await?;
                Ok(json!({"ok": true}))
            }
            other => Err(crate::errors::RoutingError::UnknownAction {
                agent: AGENT_NAME.to_string(),
                action: other.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptTemplateStore;
    use crate::validation::{FileInfo, Severity, ValidationIssue, ValidationResult};

    struct StubLlm;

    #[async_trait]
    impl crate::prompt::LlmPort for StubLlm {
        async fn complete(&self, _model_id: &str, _system_role: &str, _prompt: &str) -> Result<String, crate::errors::LLMUnavailable> {
            Ok(json!({
                "question": "What is the subject id?",
                "why_it_is_needed": "Required NWB field.",
                "example_value": "mouse_001",
                "validation_rule": "alphanumeric + underscore"
            })
            .to_string())
        }
    }

    fn agent() -> ConversationAgent {
        let store = SessionStore::new().shared();
        let prompts = Arc::new(PromptService::new(PromptTemplateStore::with_defaults(), Box::new(StubLlm)));
        ConversationAgent::new(store, prompts)
    }

    #[tokio::test]
    async fn passed_outcome_finalizes_immediately() {
        let conversation_agent = agent();
        conversation_agent
            .session_store
            .begin("uploads/a", UserMetadata::default())
            .await
            .unwrap();
        let response = conversation_agent
            .handle_evaluation_outcome(HandleEvaluationOutcomeRequest { correction_context: None })
            .await
            .unwrap();
        assert!(response.finalized);
        let snapshot = conversation_agent.session_store.get_snapshot().await;
        assert_eq!(snapshot.validation_status, ValidationStatus::Passed);
        assert_eq!(snapshot.status, crate::session::SessionStatus::Completed);
    }

    fn failing_context(attempt_number: u32) -> CorrectionContext {
        let issue = ValidationIssue {
            check_name: "check_missing_subject_id".into(),
            severity: Severity::Error,
            message: "subject_id is required".into(),
            location: "/general".into(),
            file_path: "out.nwb".into(),
            importance: None,
        };
        let file_info = FileInfo {
            nwb_version: "2.6.0".into(),
            sampling_rate_hz: None,
            channel_count: None,
            duration_seconds: None,
            dtype: None,
        };
        let validation_result = ValidationResult::from_issues(vec![issue.clone()], file_info, "out.nwb", "checksum");
        CorrectionContext {
            validation_result,
            auto_fixable_issues: vec![],
            user_input_required_issues: vec![issue],
            suggested_fixes: vec![],
            attempt_number,
            previous_issues: None,
            llm_analysis: None,
        }
    }

    #[tokio::test]
    async fn failed_outcome_presents_approve_or_decline() {
        let conversation_agent = agent();
        let response = conversation_agent
            .handle_evaluation_outcome(HandleEvaluationOutcomeRequest {
                correction_context: Some(failing_context(1)),
            })
            .await
            .unwrap();
        assert!(!response.finalized);
        let presentation = response.presentation.unwrap();
        assert_eq!(presentation.decision_kind, DecisionKind::ApproveOrDecline);
        assert!(presentation.no_progress_warning.is_none());
    }

    #[tokio::test]
    async fn no_progress_guard_warns_on_repeat_fingerprint() {
        let conversation_agent = agent();
        conversation_agent
            .handle_evaluation_outcome(HandleEvaluationOutcomeRequest {
                correction_context: Some(failing_context(1)),
            })
            .await
            .unwrap();
        let response = conversation_agent
            .handle_evaluation_outcome(HandleEvaluationOutcomeRequest {
                correction_context: Some(failing_context(2)),
            })
            .await
            .unwrap();
        let presentation = response.presentation.unwrap();
        assert!(presentation.no_progress_warning.is_some());
    }

    #[tokio::test]
    async fn decline_retry_finalizes_failed_user_declined() {
        let conversation_agent = agent();
        let response = conversation_agent
            .receive_user_decision(ReceiveUserDecisionRequest {
                decision_kind: DecisionKind::ApproveOrDecline,
                approved: false,
                accept_as_is: None,
                issues_before: 1,
            })
            .await
            .unwrap();
        assert!(matches!(response, ReceiveUserDecisionResponse::Finalized));
        let snapshot = conversation_agent.session_store.get_snapshot().await;
        assert_eq!(snapshot.validation_status, ValidationStatus::FailedUserDeclined);
        assert_eq!(snapshot.status, crate::session::SessionStatus::Failed);
    }

    #[tokio::test]
    async fn abandoning_input_finalizes_failed_user_abandoned() {
        let conversation_agent = agent();
        conversation_agent.session_store.set_awaiting_input(vec!["subject_id".to_string()]).await;
        conversation_agent.abandon_input().await.unwrap();
        let snapshot = conversation_agent.session_store.get_snapshot().await;
        assert_eq!(snapshot.validation_status, ValidationStatus::FailedUserAbandoned);
        assert_eq!(snapshot.status, crate::session::SessionStatus::Failed);
        assert!(snapshot.awaiting_user_input.is_empty());
    }

    #[tokio::test]
    async fn invalid_user_input_is_rejected_with_reprompt() {
        let conversation_agent = agent();
        let response = conversation_agent
            .receive_user_input(ReceiveUserInputRequest {
                field_name: "subject_id".to_string(),
                value: "bad id!".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(response, ReceiveUserInputResponse::Rejected { .. }));
    }

    #[tokio::test]
    async fn valid_user_input_is_accepted() {
        let conversation_agent = agent();
        let response = conversation_agent
            .receive_user_input(ReceiveUserInputRequest {
                field_name: "subject_id".to_string(),
                value: "mouse_001".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(response, ReceiveUserInputResponse::Accepted));
    }
}
