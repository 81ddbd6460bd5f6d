//! Validation result and correction-loop types.

pub mod correction;
pub mod types;

pub use correction::{
    classify_issue, fingerprint_of, AutoFixRule, CorrectionContext, EstimatedEffort, FixStrategy,
    IssueFingerprint, NoProgressGuard, AUTO_FIX_RULES,
};
pub use types::{FileInfo, OverallStatus, Severity, ValidationIssue, ValidationResult};
