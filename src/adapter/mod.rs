//! External Interface Adapter: exposes the conversion pipeline as MCP tools
//! over stdio.
//!
//! One process, one in-flight session. `upload` rejects a second request
//! while a session is already `processing`; `status` is a read-only
//! snapshot; `decide` and `provide_input` resolve whatever gate the
//! background pipeline task is currently parked on. Nothing here touches
//! `SessionState` directly — every mutation goes through the bus, the same
//! as it would for an agent-to-agent call.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::{schemars, tool, tool_router, ServerHandler};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::agents::conversation::{
    DecisionKind, HandleEvaluationOutcomeRequest, HandleEvaluationOutcomeResponse,
    ReceiveUserDecisionRequest, ReceiveUserDecisionResponse, ReceiveUserInputRequest,
    ReceiveUserInputResponse, ValidateInitialMetadataRequest,
};
use crate::agents::conversion::{ConvertFileRequest, ReconvertRequest};
use crate::agents::evaluation::EvaluateRequest;
use crate::message_bus::MessageBus;
use crate::session::{SessionState, SharedSessionStore, UserMetadata};

/// What a pending `decide` call is waiting to receive.
struct DecisionReply {
    approved: bool,
    accept_as_is: Option<bool>,
}

/// What a pending `provide_input`/`abandon_input` call resolves an input
/// gate to.
enum InputGateOutcome {
    Collected(HashMap<String, String>),
    Abandoned,
}

/// The single outstanding thing the background pipeline task is parked on.
enum Gate {
    Decision {
        expected: DecisionKind,
        reply: oneshot::Sender<DecisionReply>,
    },
    Input {
        awaiting: Vec<String>,
        collected: HashMap<String, String>,
        reply: Option<oneshot::Sender<InputGateOutcome>>,
    },
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct UploadRequest {
    #[schemars(description = "Directory containing the raw recording files to convert")]
    pub input_dir: String,
    #[schemars(description = "Subject identifier, alphanumeric plus underscores")]
    pub subject_id: String,
    #[schemars(description = "Species name, must be one of the approved taxonomy entries")]
    pub species: String,
    #[schemars(description = "Free-text description of the recording session")]
    pub session_description: String,
    #[schemars(description = "Session start time as an ISO-8601 UTC timestamp")]
    pub session_start_time: String,
    #[schemars(description = "Optional: experimenter name(s)")]
    pub experimenter: Option<String>,
    #[schemars(description = "Optional: institution name")]
    pub institution: Option<String>,
    #[schemars(description = "Optional: lab name")]
    pub lab: Option<String>,
    #[schemars(description = "Optional: subject age")]
    pub age: Option<String>,
    #[schemars(description = "Optional: subject sex")]
    pub sex: Option<String>,
    #[schemars(description = "Optional: subject weight")]
    pub weight: Option<String>,
}

impl From<&UploadRequest> for UserMetadata {
    fn from(request: &UploadRequest) -> Self {
        Self {
            subject_id: Some(request.subject_id.clone()),
            species: Some(request.species.clone()),
            session_description: Some(request.session_description.clone()),
            session_start_time: Some(request.session_start_time.clone()),
            experimenter: request.experimenter.clone(),
            institution: request.institution.clone(),
            lab: request.lab.clone(),
            age: request.age.clone(),
            sex: request.sex.clone(),
            weight: request.weight.clone(),
        }
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DecideRequest {
    #[schemars(description = "Which decision is being answered: improve_or_accept or approve_or_decline")]
    pub decision_kind: String,
    #[schemars(description = "For approve_or_decline: whether to approve another correction attempt")]
    pub approved: Option<bool>,
    #[schemars(description = "For improve_or_accept: true to accept the file as-is, false to improve it")]
    pub accept_as_is: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ProvideInputRequest {
    #[schemars(description = "Name of the metadata field being supplied")]
    pub field_name: String,
    #[schemars(description = "The value to use for this field")]
    pub value: String,
}

/// The MCP server handler wrapping the message bus and session store.
#[derive(Clone)]
pub struct OrchestratorServer {
    bus: Arc<MessageBus>,
    session_store: SharedSessionStore,
    gate: Arc<Mutex<Option<Gate>>>,
}

impl OrchestratorServer {
    pub fn new(bus: Arc<MessageBus>, session_store: SharedSessionStore) -> Self {
        Self {
            bus,
            session_store,
            gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Drive one session from a freshly validated upload through to a
    /// terminal status, pausing at each decision/input gate for the
    /// corresponding tool call to resolve it.
    async fn run_pipeline(self, input_dir: String, metadata: UserMetadata) {
        let mut corrected_metadata = metadata.clone();
        let mut previous_issues = None;
        let mut auto_fixable_for_retry = Vec::new();
        let mut is_first_attempt = true;

        loop {
            self.session_store
                .start_stage(crate::session::StageName::Conversion)
                .await;
            let convert_result = if is_first_attempt {
                self.bus
                    .dispatch(crate::message_bus::MessageEnvelope::new(
                        "conversion",
                        "convert_file",
                        serde_json::to_value(ConvertFileRequest {
                            input_dir: input_dir.clone(),
                            metadata: corrected_metadata.clone(),
                        })
                        .unwrap_or_default(),
                    ))
                    .await
            } else {
                self.bus
                    .dispatch(crate::message_bus::MessageEnvelope::new(
                        "conversion",
                        "reconvert_with_corrections",
                        serde_json::to_value(ReconvertRequest {
                            input_dir: input_dir.clone(),
                            metadata: corrected_metadata.clone(),
                            user_inputs: HashMap::new(),
                            auto_fixable_issues: auto_fixable_for_retry.clone(),
                        })
                        .unwrap_or_default(),
                    ))
                    .await
            };

            let convert_response = match convert_result {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "conversion failed, ending session");
                    self.session_store
                        .fail_stage(crate::session::StageName::Conversion, e.to_string())
                        .await;
                    self.session_store
                        .finalize(crate::session::SessionStatus::Failed)
                        .await;
                    return;
                }
            };
            self.session_store
                .complete_stage(
                    crate::session::StageName::Conversion,
                    convert_response.get("output_path").and_then(|v| v.as_str()).map(String::from),
                )
                .await;

            let output_path = convert_response["output_path"].as_str().unwrap_or_default().to_string();
            let checksum = convert_response["checksum_sha256"].as_str().unwrap_or_default().to_string();
            let attempt_number = convert_response["attempt_number"].as_u64().unwrap_or(0) as u32;
            self.session_store.set_output_path(output_path.clone()).await;

            self.session_store
                .start_stage(crate::session::StageName::Evaluation)
                .await;
            let evaluate_result = self
                .bus
                .dispatch(crate::message_bus::MessageEnvelope::new(
                    "evaluation",
                    "evaluate",
                    serde_json::to_value(EvaluateRequest {
                        nwb_path: output_path.clone(),
                        checksum_sha256: checksum,
                        attempt_number,
                        previous_issues: previous_issues.clone(),
                    })
                    .unwrap_or_default(),
                ))
                .await;

            let evaluate_response = match evaluate_result {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "evaluation failed, ending session");
                    self.session_store
                        .fail_stage(crate::session::StageName::Evaluation, e.to_string())
                        .await;
                    self.session_store
                        .finalize(crate::session::SessionStatus::Failed)
                        .await;
                    return;
                }
            };
            self.session_store
                .complete_stage(crate::session::StageName::Evaluation, None)
                .await;

            let validation_result: crate::validation::ValidationResult =
                serde_json::from_value(evaluate_response["validation_result"].clone()).unwrap_or_else(|_| {
                    crate::validation::ValidationResult::from_issues(
                        Vec::new(),
                        crate::validation::FileInfo {
                            nwb_version: String::new(),
                            sampling_rate_hz: None,
                            channel_count: None,
                            duration_seconds: None,
                            dtype: None,
                        },
                        output_path.clone(),
                        String::new(),
                    )
                });
            let correction_context: Option<crate::validation::CorrectionContext> =
                serde_json::from_value(evaluate_response["correction_context"].clone()).unwrap_or(None);
            previous_issues = correction_context
                .as_ref()
                .map(|ctx| ctx.validation_result.issues.clone());

            let nwb_name = std::path::Path::new(&output_path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("session")
                .to_string();
            let session_id = self.session_store.get_snapshot().await.session_id;

            self.session_store
                .start_stage(crate::session::StageName::ReportGeneration)
                .await;
            let report_result = if let Some(context) = &correction_context {
                self.bus
                    .dispatch(crate::message_bus::MessageEnvelope::new(
                        "evaluation",
                        "generate_failed_context",
                        serde_json::to_value(crate::agents::evaluation::GenerateFailedContextRequest {
                            nwb_name: nwb_name.clone(),
                            run_id: session_id,
                            correction_context: context.clone(),
                        })
                        .unwrap_or_default(),
                    ))
                    .await
            } else {
                self.bus
                    .dispatch(crate::message_bus::MessageEnvelope::new(
                        "evaluation",
                        "generate_passed_report",
                        serde_json::to_value(crate::agents::evaluation::GeneratePassedReportRequest {
                            nwb_name: nwb_name.clone(),
                            validation_result: validation_result.clone(),
                        })
                        .unwrap_or_default(),
                    ))
                    .await
            };
            match report_result {
                Ok(v) => {
                    self.session_store
                        .complete_stage(
                            crate::session::StageName::ReportGeneration,
                            v.get("path").and_then(|p| p.as_str()).map(String::from),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, "report generation failed, ending session");
                    self.session_store
                        .fail_stage(crate::session::StageName::ReportGeneration, e.to_string())
                        .await;
                    self.session_store
                        .finalize(crate::session::SessionStatus::Failed)
                        .await;
                    return;
                }
            }

            let outcome_result = self
                .bus
                .dispatch(crate::message_bus::MessageEnvelope::new(
                    "conversation",
                    "handle_evaluation_outcome",
                    serde_json::to_value(HandleEvaluationOutcomeRequest {
                        correction_context: correction_context.clone(),
                    })
                    .unwrap_or_default(),
                ))
                .await;

            let outcome: HandleEvaluationOutcomeResponse = match outcome_result {
                Ok(v) => serde_json::from_value(v).unwrap_or(HandleEvaluationOutcomeResponse {
                    finalized: true,
                    presentation: None,
                }),
                Err(e) => {
                    warn!(error = %e, "conversation outcome handling failed, ending session");
                    self.session_store
                        .finalize(crate::session::SessionStatus::Failed)
                        .await;
                    return;
                }
            };

            if outcome.finalized {
                info!("session reached a terminal state");
                return;
            }

            let presentation = match outcome.presentation {
                Some(p) => p,
                None => return,
            };
            let context = match correction_context {
                Some(c) => c,
                None => return,
            };

            let (tx, rx) = oneshot::channel();
            *self.gate.lock().await = Some(Gate::Decision {
                expected: presentation.decision_kind,
                reply: tx,
            });
            let reply = match rx.await {
                Ok(r) => r,
                Err(_) => return,
            };

            let decision_result = self
                .bus
                .dispatch(crate::message_bus::MessageEnvelope::new(
                    "conversation",
                    "receive_user_decision",
                    serde_json::to_value(ReceiveUserDecisionRequest {
                        decision_kind: presentation.decision_kind,
                        approved: reply.approved,
                        accept_as_is: reply.accept_as_is,
                        issues_before: context.validation_result.issues.len(),
                    })
                    .unwrap_or_default(),
                ))
                .await;

            let decision: ReceiveUserDecisionResponse = match decision_result {
                Ok(v) => serde_json::from_value(v).unwrap_or(ReceiveUserDecisionResponse::Finalized),
                Err(_) => return,
            };

            if matches!(decision, ReceiveUserDecisionResponse::Finalized) {
                return;
            }

            auto_fixable_for_retry = context.auto_fixable_issues.clone();

            if !context.user_input_required_issues.is_empty() {
                let awaiting: Vec<String> = context
                    .user_input_required_issues
                    .iter()
                    .map(|i| i.check_name.clone())
                    .collect();
                self.session_store.set_awaiting_input(awaiting.clone()).await;

                let (tx, rx) = oneshot::channel();
                *self.gate.lock().await = Some(Gate::Input {
                    awaiting,
                    collected: HashMap::new(),
                    reply: Some(tx),
                });
                let collected = match rx.await {
                    Ok(InputGateOutcome::Collected(c)) => c,
                    Ok(InputGateOutcome::Abandoned) | Err(_) => {
                        // The user walked away from a pending input request
                        // (or the gate was dropped without an answer) —
                        // finalize through the Conversation agent rather
                        // than leaving the session stuck `processing`.
                        let _ = self
                            .bus
                            .dispatch(crate::message_bus::MessageEnvelope::new(
                                "conversation",
                                "abandon_input",
                                serde_json::Value::Null,
                            ))
                            .await;
                        return;
                    }
                };
                self.session_store.set_awaiting_input(Vec::new()).await;
                for (field, value) in &collected {
                    apply_field(&mut corrected_metadata, field, value);
                }
            }

            is_first_attempt = false;
        }
    }

    async fn status_snapshot(&self) -> SessionState {
        self.session_store.get_snapshot().await
    }
}

fn apply_field(metadata: &mut UserMetadata, field: &str, value: &str) {
    match field {
        "subject_id" => metadata.subject_id = Some(value.to_string()),
        "species" => metadata.species = Some(value.to_string()),
        "session_description" => metadata.session_description = Some(value.to_string()),
        "session_start_time" => metadata.session_start_time = Some(value.to_string()),
        "experimenter" => metadata.experimenter = Some(value.to_string()),
        "institution" => metadata.institution = Some(value.to_string()),
        "lab" => metadata.lab = Some(value.to_string()),
        "age" => metadata.age = Some(value.to_string()),
        "sex" => metadata.sex = Some(value.to_string()),
        "weight" => metadata.weight = Some(value.to_string()),
        _ => {}
    }
}

#[tool_router]
impl OrchestratorServer {
    #[tool(description = "Start a conversion session: validates metadata, rejects if a session is already in progress, then runs conversion and evaluation in the background.")]
    async fn upload(&self, Parameters(request): Parameters<UploadRequest>) -> Result<String, String> {
        let metadata: UserMetadata = (&request).into();

        let validate_result = self
            .bus
            .dispatch(crate::message_bus::MessageEnvelope::new(
                "conversation",
                "validate_initial_metadata",
                serde_json::to_value(ValidateInitialMetadataRequest {
                    metadata: metadata.clone(),
                })
                .unwrap_or_default(),
            ))
            .await;

        if let Err(e) = validate_result {
            return Ok(json!({"accepted": false, "reason": e.to_string()}).to_string());
        }

        if let Err(e) = self.session_store.begin(request.input_dir.clone(), metadata.clone()).await {
            return Err(e.to_string());
        }

        let handle = self.clone();
        let input_dir = request.input_dir.clone();
        tokio::spawn(async move { handle.run_pipeline(input_dir, metadata).await });

        Ok(json!({"accepted": true, "status": "processing"}).to_string())
    }

    #[tool(description = "Read-only snapshot of the current session's status, stages, and any pending decision or input request.")]
    async fn status(&self) -> Result<String, String> {
        let snapshot = self.status_snapshot().await;
        serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())
    }

    #[tool(description = "Answer a pending improve_or_accept or approve_or_decline decision.")]
    async fn decide(&self, Parameters(request): Parameters<DecideRequest>) -> Result<String, String> {
        let requested_kind = match request.decision_kind.as_str() {
            "improve_or_accept" => DecisionKind::ImproveOrAccept,
            "approve_or_decline" => DecisionKind::ApproveOrDecline,
            other => return Err(format!("unknown decision_kind '{other}'")),
        };

        let mut gate = self.gate.lock().await;
        match gate.take() {
            Some(Gate::Decision { expected, reply }) if expected == requested_kind => {
                let _ = reply.send(DecisionReply {
                    approved: request.approved.unwrap_or(false),
                    accept_as_is: request.accept_as_is,
                });
                Ok(json!({"accepted": true}).to_string())
            }
            Some(other @ Gate::Decision { .. }) => {
                *gate = Some(other);
                Err("decision_kind does not match the pending decision".to_string())
            }
            other => {
                *gate = other;
                Err("no decision is currently pending".to_string())
            }
        }
    }

    #[tool(description = "Supply one field's value in response to a pending user-input request.")]
    async fn provide_input(&self, Parameters(request): Parameters<ProvideInputRequest>) -> Result<String, String> {
        let validation_result = self
            .bus
            .dispatch(crate::message_bus::MessageEnvelope::new(
                "conversation",
                "receive_user_input",
                serde_json::to_value(ReceiveUserInputRequest {
                    field_name: request.field_name.clone(),
                    value: request.value.clone(),
                })
                .unwrap_or_default(),
            ))
            .await
            .map_err(|e| e.to_string())?;

        let response: ReceiveUserInputResponse =
            serde_json::from_value(validation_result).unwrap_or(ReceiveUserInputResponse::Accepted);

        if let ReceiveUserInputResponse::Rejected { reprompt } = response {
            return Ok(json!({"accepted": false, "reprompt": reprompt}).to_string());
        }

        let mut gate = self.gate.lock().await;
        match gate.take() {
            Some(Gate::Input { awaiting, mut collected, mut reply }) => {
                collected.insert(request.field_name.clone(), request.value.clone());
                let remaining: Vec<String> = awaiting
                    .iter()
                    .filter(|f| !collected.contains_key(*f))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    if let Some(tx) = reply.take() {
                        let _ = tx.send(InputGateOutcome::Collected(collected));
                    }
                    *gate = None;
                } else {
                    *gate = Some(Gate::Input {
                        awaiting,
                        collected,
                        reply,
                    });
                }
                Ok(json!({"accepted": true, "remaining_fields": remaining}).to_string())
            }
            other => {
                *gate = other;
                Ok(json!({"accepted": true}).to_string())
            }
        }
    }

    #[tool(description = "Abandon a pending user-input request, ending the session as failed_user_abandoned.")]
    async fn abandon_input(&self) -> Result<String, String> {
        let mut gate = self.gate.lock().await;
        match gate.take() {
            Some(Gate::Input { reply: Some(reply), .. }) => {
                let _ = reply.send(InputGateOutcome::Abandoned);
                Ok(json!({"accepted": true}).to_string())
            }
            other => {
                *gate = other;
                Err("no input request is currently pending".to_string())
            }
        }
    }

    #[tool(description = "Return the path and checksum of the converted NWB file, once the session has completed.")]
    async fn download(&self) -> Result<String, String> {
        let snapshot = self.status_snapshot().await;
        match snapshot.output_path {
            Some(path) => Ok(json!({"output_path": path}).to_string()),
            None => Err("no converted file is available for the current session".to_string()),
        }
    }
}

impl ServerHandler for OrchestratorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Converts a directory of raw neurophysiology recordings into an NWB file, \
                 validates it, and renders a report. `upload` starts a session, `status` polls \
                 it, `decide` and `provide_input` answer pending questions from the correction \
                 loop, `abandon_input` gives up on a pending input request instead, and \
                 `download` returns the finished file once the session completes."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
