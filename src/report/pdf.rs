//! PDF rendering for `PASSED` / `PASSED_WITH_ISSUES` evaluation reports.

use std::io::BufWriter;
use std::path::Path;

use printpdf::{BuiltinFont, Mm, PdfDocument};

use crate::errors::ReportGenerationError;
use crate::validation::{OverallStatus, ValidationResult};

const PAGE_WIDTH_MM: f64 = 210.0;
const PAGE_HEIGHT_MM: f64 = 297.0;
const LEFT_MARGIN_MM: f64 = 20.0;
const LINE_HEIGHT_MM: f64 = 6.0;

/// The LLM's quality analysis, as produced by the `evaluation_quality` template.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LlmQualityAnalysis {
    pub executive_summary: String,
    pub quality_assessment: String,
    pub recommendations: Vec<String>,
}

/// Render the success-side PDF report, in a fixed order:
/// cover page, executive summary, file information table, issue counts
/// table, per-issue section (only when issues are present), quality
/// assessment, recommendations.
pub fn render_passed_pdf(
    nwb_name: &str,
    result: &ValidationResult,
    llm: &LlmQualityAnalysis,
    out_path: &Path,
) -> Result<(), ReportGenerationError> {
    let status_label = match result.overall_status {
        OverallStatus::Passed => "PASSED",
        OverallStatus::PassedWithIssues => "PASSED WITH ISSUES",
        OverallStatus::Failed => {
            return Err(ReportGenerationError::PdfRenderFailed {
                reason: "render_passed_pdf called with a FAILED result".to_string(),
            })
        }
    };

    let (doc, page1, layer1) = PdfDocument::new(
        format!("NWB Evaluation Report — {nwb_name}"),
        Mm(PAGE_WIDTH_MM),
        Mm(PAGE_HEIGHT_MM),
        "Layer 1",
    );
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| ReportGenerationError::PdfRenderFailed { reason: e.to_string() })?;

    let mut cursor = Cursor::new(doc.get_page(page1).get_layer(layer1), &font);

    // Cover page
    cursor.heading(&format!("NWB Evaluation Report: {status_label}"));
    cursor.line(&format!("File: {nwb_name}"));
    cursor.line(&format!("NWB version: {}", result.file_info.nwb_version));
    cursor.line(&format!("Date: {}", result.timestamp.to_rfc3339()));
    cursor.gap();

    // Executive summary
    cursor.heading("Executive Summary");
    cursor.wrapped(&llm.executive_summary);
    cursor.gap();

    // File information table
    cursor.heading("File Information");
    if let Some(rate) = result.file_info.sampling_rate_hz {
        cursor.line(&format!("Sampling rate: {rate} Hz"));
    }
    if let Some(channels) = result.file_info.channel_count {
        cursor.line(&format!("Channel count: {channels}"));
    }
    if let Some(duration) = result.file_info.duration_seconds {
        cursor.line(&format!("Duration: {duration} s"));
    }
    if let Some(dtype) = &result.file_info.dtype {
        cursor.line(&format!("Dtype: {dtype}"));
    }
    cursor.gap();

    // Issue counts table
    cursor.heading("Issue Counts");
    for severity in crate::validation::Severity::all() {
        let count = result.issue_counts.get(&severity).copied().unwrap_or(0);
        cursor.line(&format!("{severity:?}: {count}"));
    }
    cursor.gap();

    // Per-issue section, only for PASSED_WITH_ISSUES
    if matches!(result.overall_status, OverallStatus::PassedWithIssues) {
        cursor.heading("Issues");
        for issue in &result.issues {
            cursor.line(&format!(
                "[{:?}] {} — {} ({})",
                issue.severity, issue.location, issue.message, issue.check_name
            ));
        }
        cursor.gap();
    }

    // Quality assessment
    cursor.heading("Quality Assessment");
    cursor.wrapped(&llm.quality_assessment);
    cursor.gap();

    // Recommendations
    cursor.heading("Recommendations");
    for recommendation in &llm.recommendations {
        cursor.line(&format!("- {recommendation}"));
    }

    let file = std::fs::File::create(out_path).map_err(|e| ReportGenerationError::WriteFailed {
        path: out_path.display().to_string(),
        reason: e.to_string(),
    })?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|e| ReportGenerationError::WriteFailed {
            path: out_path.display().to_string(),
            reason: e.to_string(),
        })?;

    Ok(())
}

/// Small layout helper walking a single text layer top-to-bottom. Not
/// meant to be reusable beyond this module — a real multi-page report
/// would need page-break handling, which this fixed-section layout
/// doesn't require for typical issue counts.
struct Cursor<'a> {
    layer: printpdf::PdfLayerReference,
    font: &'a printpdf::IndirectFontRef,
    y_mm: f64,
}

impl<'a> Cursor<'a> {
    fn new(layer: printpdf::PdfLayerReference, font: &'a printpdf::IndirectFontRef) -> Self {
        Self {
            layer,
            font,
            y_mm: PAGE_HEIGHT_MM - 20.0,
        }
    }

    fn heading(&mut self, text: &str) {
        self.layer
            .use_text(text, 14.0, Mm(LEFT_MARGIN_MM), Mm(self.y_mm), self.font);
        self.y_mm -= LINE_HEIGHT_MM * 1.5;
    }

    fn line(&mut self, text: &str) {
        self.layer
            .use_text(text, 10.0, Mm(LEFT_MARGIN_MM), Mm(self.y_mm), self.font);
        self.y_mm -= LINE_HEIGHT_MM;
    }

    fn wrapped(&mut self, text: &str) {
        for chunk in text.as_bytes().chunks(90) {
            let piece = String::from_utf8_lossy(chunk);
            self.line(&piece);
        }
    }

    fn gap(&mut self) {
        self.y_mm -= LINE_HEIGHT_MM;
    }
}
