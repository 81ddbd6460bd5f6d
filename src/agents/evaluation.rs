//! Evaluation Agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{CoreError, EvaluationError};
use crate::external::NwbLibraryPort;
use crate::message_bus::{AgentHandler, HandlerInvocation, HandlerResponse};
use crate::prompt::PromptService;
use crate::report::{LlmCorrectionAnalysis, LlmQualityAnalysis, ReportService, RenderedArtifact};
use crate::session::SessionStore;
use crate::validation::{
    classify_issue, CorrectionContext, EstimatedEffort, FixStrategy, OverallStatus, Severity,
    ValidationIssue, ValidationResult,
};

pub const AGENT_NAME: &str = "evaluation";
const ACTIONS: &[&str] = &["evaluate", "generate_passed_report", "generate_failed_context"];

/// Evaluation Agent: runs the inspector, derives overall status, and
/// builds the correction context the Conversation Agent surfaces to the user.
pub struct EvaluationAgent {
    session_store: Arc<SessionStore>,
    library: Arc<dyn NwbLibraryPort>,
    prompts: Arc<PromptService>,
    reports: ReportService,
}

impl EvaluationAgent {
    pub fn new(
        session_store: Arc<SessionStore>,
        library: Arc<dyn NwbLibraryPort>,
        prompts: Arc<PromptService>,
        reports: ReportService,
    ) -> Self {
        Self {
            session_store,
            library,
            prompts,
            reports,
        }
    }

    /// Run the inspector against the converted file and derive
    /// `OverallStatus`. On `FAILED`, also builds the
    /// `CorrectionContext` the caller forwards to Conversation.
    async fn evaluate(&self, request: EvaluateRequest) -> Result<EvaluateResponse, CoreError> {
        let nwb_path = PathBuf::from(&request.nwb_path);

        let file_info = self
            .library
            .can_open(&nwb_path)
            .await
            .map_err(|e| EvaluationError::UnreadableFile { reason: e.0 })?;

        let issues = self
            .library
            .run_inspector(&nwb_path)
            .await
            .map_err(|e| EvaluationError::LibraryFailed { library_error: e.0 })?;

        let checksum = request.checksum_sha256.clone();
        let result = ValidationResult::from_issues(issues, file_info, request.nwb_path.clone(), checksum);

        let correction_context = if result.overall_status != OverallStatus::Passed {
            Some(self.build_correction_context(&result, request.attempt_number, request.previous_issues).await?)
        } else {
            None
        };

        Ok(EvaluateResponse {
            validation_result: result,
            correction_context,
        })
    }

    /// Classify every issue and ask the LLM for its fix roadmap via the
    /// `evaluation_correction` template.
    async fn build_correction_context(
        &self,
        result: &ValidationResult,
        attempt_number: u32,
        previous_issues: Option<Vec<ValidationIssue>>,
    ) -> Result<CorrectionContext, CoreError> {
        let mut variables = HashMap::new();
        variables.insert("issues".to_string(), serde_json::to_value(&result.issues).unwrap_or_default());
        variables.insert("attempt_number".to_string(), json!(attempt_number));
        variables.insert(
            "previous_issues".to_string(),
            serde_json::to_value(&previous_issues).unwrap_or(json!(null)),
        );

        let llm_response = self.prompts.invoke("evaluation_correction", &variables).await?;
        let analysis: LlmCorrectionAnalysis = serde_json::from_value(llm_response.clone())
            .unwrap_or(LlmCorrectionAnalysis {
                issue_analysis: Vec::new(),
                fix_roadmap: Vec::new(),
                auto_fixable: Vec::new(),
                user_input_needed: Vec::new(),
            });

        let mut auto_fixable_issues = Vec::new();
        let mut user_input_required_issues = Vec::new();
        let mut suggested_fixes = Vec::new();

        for issue in &result.issues {
            let llm_says_auto_fixable = if analysis.auto_fixable.contains(&issue.check_name) {
                Some(true)
            } else if analysis.user_input_needed.contains(&issue.check_name) {
                Some(false)
            } else {
                None
            };
            let is_auto_fixable = classify_issue(issue, llm_says_auto_fixable);

            if is_auto_fixable {
                auto_fixable_issues.push(issue.clone());
            } else {
                user_input_required_issues.push(issue.clone());
            }

            suggested_fixes.push(FixStrategy {
                issue_ref: format!("{}@{}", issue.check_name, issue.location),
                strategy_text: fix_strategy_text(issue),
                auto_fixable: is_auto_fixable,
                user_input_required: !is_auto_fixable,
                user_prompt: if is_auto_fixable { None } else { Some(user_prompt_for(issue)) },
                estimated_effort: Some(estimated_effort_for(issue.severity)),
            });
        }

        Ok(CorrectionContext {
            validation_result: result.clone(),
            auto_fixable_issues,
            user_input_required_issues,
            suggested_fixes,
            attempt_number,
            previous_issues,
            llm_analysis: Some(llm_response),
        })
    }

    async fn generate_passed_report(&self, request: GeneratePassedReportRequest) -> Result<RenderedArtifact, CoreError> {
        let mut variables = HashMap::new();
        variables.insert("overall_status".to_string(), json!(format!("{:?}", request.validation_result.overall_status)));
        variables.insert(
            "issue_counts".to_string(),
            serde_json::to_value(&request.validation_result.issue_counts).unwrap_or_default(),
        );
        variables.insert(
            "file_info".to_string(),
            serde_json::to_value(&request.validation_result.file_info).unwrap_or_default(),
        );

        let llm_response = self.prompts.invoke("evaluation_quality", &variables).await?;
        let analysis: LlmQualityAnalysis = serde_json::from_value(llm_response).unwrap_or(LlmQualityAnalysis {
            executive_summary: String::new(),
            quality_assessment: String::new(),
            recommendations: Vec::new(),
        });

        Ok(self
            .reports
            .render_passed(&request.nwb_name, &request.validation_result, &analysis)?)
    }

    async fn generate_failed_context(&self, request: GenerateFailedContextRequest) -> Result<RenderedArtifact, CoreError> {
        let analysis = LlmCorrectionAnalysis {
            issue_analysis: request
                .correction_context
                .llm_analysis
                .as_ref()
                .and_then(|v| v.get("issue_analysis").cloned())
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            fix_roadmap: request
                .correction_context
                .suggested_fixes
                .iter()
                .map(|f| f.strategy_text.clone())
                .collect(),
            auto_fixable: request
                .correction_context
                .auto_fixable_issues
                .iter()
                .map(|i| i.check_name.clone())
                .collect(),
            user_input_needed: request
                .correction_context
                .user_input_required_issues
                .iter()
                .map(|i| i.check_name.clone())
                .collect(),
        };

        Ok(self.reports.render_failed(
            &request.nwb_name,
            &request.run_id,
            &request.correction_context,
            &analysis,
        )?)
    }
}

fn fix_strategy_text(issue: &ValidationIssue) -> String {
    format!("{}: {}", issue.check_name, issue.message)
}

fn user_prompt_for(issue: &ValidationIssue) -> String {
    format!("Please provide a value to resolve: {}", issue.message)
}

fn estimated_effort_for(severity: Severity) -> EstimatedEffort {
    match severity {
        Severity::Critical | Severity::Error => EstimatedEffort::Hard,
        Severity::Warning => EstimatedEffort::Medium,
        Severity::BestPractice => EstimatedEffort::Easy,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub nwb_path: String,
    pub checksum_sha256: String,
    pub attempt_number: u32,
    pub previous_issues: Option<Vec<ValidationIssue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub validation_result: ValidationResult,
    pub correction_context: Option<CorrectionContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratePassedReportRequest {
    pub nwb_name: String,
    pub validation_result: ValidationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateFailedContextRequest {
    pub nwb_name: String,
    pub run_id: String,
    pub correction_context: CorrectionContext,
}

#[async_trait]
impl AgentHandler for EvaluationAgent {
    fn name(&self) -> &'static str {
        AGENT_NAME
    }

    fn actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn handle(&self, invocation: HandlerInvocation) -> Result<HandlerResponse, CoreError> {
        match invocation.action.as_str() {
            "evaluate" => {
                let request: EvaluateRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| EvaluationError::LibraryFailed { library_error: e.to_string() })?;
                let response = self.evaluate(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            "generate_passed_report" => {
                let request: GeneratePassedReportRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| EvaluationError::LibraryFailed { library_error: e.to_string() })?;
                let artifact = self.generate_passed_report(request).await?;
                Ok(json!({"path": artifact.path.display().to_string(), "checksum_sha256": artifact.checksum_sha256}))
            }
            "generate_failed_context" => {
                let request: GenerateFailedContextRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| EvaluationError::LibraryFailed { library_error: e.to_string() })?;
                let artifact = self.generate_failed_context(request).await?;
                Ok(json!({"path": artifact.path.display().to_string(), "checksum_sha256": artifact.checksum_sha256}))
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
    use crate::external::MockNwbLibrary;
    use crate::prompt::PromptTemplateStore;
    use crate::validation::FileInfo;

    struct StubLlm;

    #[async_trait]
    impl crate::prompt::LlmPort for StubLlm {
        async fn complete(&self, _model_id: &str, _system_role: &str, prompt: &str) -> Result<String, crate::errors::LLMUnavailable> {
            if prompt.contains("fix_roadmap") || true {
                Ok(json!({
                    "issue_analysis": [],
                    "fix_roadmap": ["fix metadata"],
                    "auto_fixable": ["check_missing_optional_metadata"],
                    "user_input_needed": ["check_missing_required_metadata"]
                })
                .to_string())
            } else {
                unreachable!()
            }
        }
    }

    fn issue(check_name: &str, severity: Severity) -> ValidationIssue {
        ValidationIssue {
            check_name: check_name.into(),
            severity,
            message: "msg".into(),
            location: "/general".into(),
            file_path: "out.nwb".into(),
            importance: None,
        }
    }

    #[tokio::test]
    async fn evaluate_builds_correction_context_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let nwb_path = dir.path().join("out.nwb");
        std::fs::write(&nwb_path, b"placeholder").unwrap();

        let library = Arc::new(MockNwbLibrary {
            file_info: FileInfo {
                nwb_version: "2.6.0".into(),
                sampling_rate_hz: Some(30_000.0),
                channel_count: Some(16),
                duration_seconds: Some(5.0),
                dtype: Some("int16".into()),
            },
            issues: vec![issue("check_missing_required_metadata", Severity::Error)],
        });
        let prompts = Arc::new(PromptService::new(PromptTemplateStore::with_defaults(), Box::new(StubLlm)));
        let report_dir = tempfile::tempdir().unwrap();
        let reports = ReportService::new(report_dir.path());
        let store = SessionStore::new().shared();

        let agent = EvaluationAgent::new(store, library, prompts, reports);
        let response = agent
            .evaluate(EvaluateRequest {
                nwb_path: nwb_path.display().to_string(),
                checksum_sha256: "abc123".into(),
                attempt_number: 1,
                previous_issues: None,
            })
            .await
            .unwrap();

        assert_eq!(response.validation_result.overall_status, OverallStatus::Failed);
        let ctx = response.correction_context.unwrap();
        assert!(ctx.classification_is_subset_of_issues());
        assert_eq!(ctx.user_input_required_issues.len(), 1);
    }
}
