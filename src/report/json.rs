//! JSON rendering for `FAILED` correction context reports.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ReportGenerationError;
use crate::validation::CorrectionContext;

/// The LLM's correction analysis, as produced by the `evaluation_correction` template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCorrectionAnalysis {
    pub issue_analysis: Vec<serde_json::Value>,
    pub fix_roadmap: Vec<String>,
    pub auto_fixable: Vec<String>,
    pub user_input_needed: Vec<String>,
}

/// The schema-valid JSON document written for `FAILED` attempts:
/// run metadata, failure summary, critical issues, fix roadmap,
/// auto-fixable/user-input categorization, references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionReportDocument {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub attempt_number: u32,
    pub failure_summary: serde_json::Value,
    pub critical_issues: Vec<serde_json::Value>,
    pub fix_roadmap: Vec<String>,
    pub auto_fixable: Vec<String>,
    pub user_input_needed: Vec<String>,
    pub references: Vec<String>,
}

pub fn build_correction_document(
    run_id: impl Into<String>,
    context: &CorrectionContext,
    llm: &LlmCorrectionAnalysis,
) -> CorrectionReportDocument {
    let critical_issues = context
        .validation_result
        .issues
        .iter()
        .filter(|i| i.severity.blocks_pass())
        .map(|i| {
            serde_json::json!({
                "check_name": i.check_name,
                "severity": i.severity,
                "message": i.message,
                "location": i.location,
            })
        })
        .collect();

    CorrectionReportDocument {
        run_id: run_id.into(),
        timestamp: Utc::now(),
        status: "FAILED".to_string(),
        attempt_number: context.attempt_number,
        failure_summary: serde_json::json!({ "issue_analysis": llm.issue_analysis }),
        critical_issues,
        fix_roadmap: llm.fix_roadmap.clone(),
        auto_fixable: llm.auto_fixable.clone(),
        user_input_needed: llm.user_input_needed.clone(),
        references: vec![
            "https://www.nwb.org/".to_string(),
            "https://nwbinspector.readthedocs.io/".to_string(),
        ],
    }
}

/// Pretty-print and write the correction document to disk.
pub fn write_correction_document(
    document: &CorrectionReportDocument,
    out_path: &Path,
) -> Result<(), ReportGenerationError> {
    let pretty = serde_json::to_string_pretty(document)
        .map_err(|e| ReportGenerationError::JsonRenderFailed { reason: e.to_string() })?;
    std::fs::write(out_path, pretty).map_err(|e| ReportGenerationError::WriteFailed {
        path: out_path.display().to_string(),
        reason: e.to_string(),
    })
}
