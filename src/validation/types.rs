//! Validation result types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of one inspector finding, ordered worst-to-best so the
/// derivation rule can be expressed as a simple `max` over issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    BestPractice,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn all() -> [Severity; 4] {
        [
            Severity::Critical,
            Severity::Error,
            Severity::Warning,
            Severity::BestPractice,
        ]
    }

    pub fn blocks_pass(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Error)
    }
}

/// One finding returned by the NWB inspector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub check_name: String,
    pub severity: Severity,
    pub message: String,
    pub location: String,
    pub file_path: String,
    pub importance: Option<String>,
}

impl ValidationIssue {
    /// The `{check_name, location}` pair used for no-progress fingerprinting.
    pub fn fingerprint_key(&self) -> (String, String) {
        (self.check_name.clone(), self.location.clone())
    }
}

/// Overall disposition of an evaluation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Passed,
    PassedWithIssues,
    Failed,
}

/// Technical metadata auto-extracted from the recording plus the produced
/// file, surfaced on the PDF's "file information" table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub nwb_version: String,
    pub sampling_rate_hz: Option<f64>,
    pub channel_count: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub dtype: Option<String>,
}

/// The result of one evaluation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub overall_status: OverallStatus,
    pub issues: Vec<ValidationIssue>,
    pub issue_counts: HashMap<Severity, usize>,
    pub file_info: FileInfo,
    pub timestamp: DateTime<Utc>,
    pub nwb_file_path: String,
    pub checksum_sha256: String,
}

impl ValidationResult {
    /// Build a result from a raw issue list: `FAILED` iff any CRITICAL/ERROR
    /// issue exists, else `PASSED_WITH_ISSUES` iff the issue list is
    /// non-empty, else `PASSED`.
    pub fn from_issues(
        issues: Vec<ValidationIssue>,
        file_info: FileInfo,
        nwb_file_path: impl Into<String>,
        checksum_sha256: impl Into<String>,
    ) -> Self {
        let mut issue_counts: HashMap<Severity, usize> = HashMap::new();
        for issue in &issues {
            *issue_counts.entry(issue.severity).or_insert(0) += 1;
        }

        let overall_status = if issues.iter().any(|i| i.severity.blocks_pass()) {
            OverallStatus::Failed
        } else if !issues.is_empty() {
            OverallStatus::PassedWithIssues
        } else {
            OverallStatus::Passed
        };

        Self {
            overall_status,
            issues,
            issue_counts,
            file_info,
            timestamp: Utc::now(),
            nwb_file_path: nwb_file_path.into(),
            checksum_sha256: checksum_sha256.into(),
        }
    }

    /// `Σ issue_counts.values() == issues.length`.
    pub fn counts_are_consistent(&self) -> bool {
        self.issue_counts.values().sum::<usize>() == self.issues.len()
    }

    /// The set `{(check_name, location)}` used for no-progress detection.
    pub fn fingerprint(&self) -> std::collections::BTreeSet<(String, String)> {
        self.issues.iter().map(ValidationIssue::fingerprint_key).collect()
    }
}
