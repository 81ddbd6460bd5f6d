//! Report Service: turn evaluation + LLM output into artifacts.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::json::{build_correction_document, write_correction_document, LlmCorrectionAnalysis};
use super::pdf::{render_passed_pdf, LlmQualityAnalysis};
use crate::errors::ReportGenerationError;
use crate::validation::{CorrectionContext, ValidationResult};

/// Path plus checksum of a rendered artifact.
pub struct RenderedArtifact {
    pub path: PathBuf,
    pub checksum_sha256: String,
}

pub struct ReportService {
    report_dir: PathBuf,
}

impl ReportService {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    /// `<nwb_name>_evaluation_report.pdf`.
    pub fn render_passed(
        &self,
        nwb_name: &str,
        result: &ValidationResult,
        llm: &LlmQualityAnalysis,
    ) -> Result<RenderedArtifact, ReportGenerationError> {
        let path = self.report_dir.join(format!("{nwb_name}_evaluation_report.pdf"));
        render_passed_pdf(nwb_name, result, llm, &path)?;
        let checksum_sha256 = checksum_of(&path)?;
        Ok(RenderedArtifact { path, checksum_sha256 })
    }

    /// `<nwb_name>_correction_context.json`.
    pub fn render_failed(
        &self,
        nwb_name: &str,
        run_id: impl Into<String>,
        context: &CorrectionContext,
        llm: &LlmCorrectionAnalysis,
    ) -> Result<RenderedArtifact, ReportGenerationError> {
        let document = build_correction_document(run_id, context, llm);
        let path = self.report_dir.join(format!("{nwb_name}_correction_context.json"));
        write_correction_document(&document, &path)?;
        let checksum_sha256 = checksum_of(&path)?;
        Ok(RenderedArtifact { path, checksum_sha256 })
    }
}

fn checksum_of(path: &Path) -> Result<String, ReportGenerationError> {
    let bytes = std::fs::read(path).map_err(|e| ReportGenerationError::WriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
