//! Correction context and the no-progress guard.
//!
//! Same shape of problem as a tiered correction loop (classify an attempt,
//! decide whether another attempt is worth making, track a streak across
//! attempts), but the escalation tiers become an auto-fixable/user-input
//! classification instead of a model tier, and the "no progress" streak
//! becomes a single fingerprint comparison rather than a counted streak.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::types::{Severity, ValidationIssue, ValidationResult};

/// Estimated effort to apply a suggested fix, surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedEffort {
    Easy,
    Medium,
    Hard,
}

/// One suggested remedy for an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStrategy {
    pub issue_ref: String,
    pub strategy_text: String,
    pub auto_fixable: bool,
    pub user_input_required: bool,
    pub user_prompt: Option<String>,
    pub estimated_effort: Option<EstimatedEffort>,
}

/// The package Evaluation hands to Conversation when validation surfaces
/// issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionContext {
    pub validation_result: ValidationResult,
    pub auto_fixable_issues: Vec<ValidationIssue>,
    pub user_input_required_issues: Vec<ValidationIssue>,
    pub suggested_fixes: Vec<FixStrategy>,
    pub attempt_number: u32,
    pub previous_issues: Option<Vec<ValidationIssue>>,
    pub llm_analysis: Option<serde_json::Value>,
}

impl CorrectionContext {
    /// `{auto_fixable_issues} ∪ {user_input_required_issues} ⊆ validation_result.issues`.
    pub fn classification_is_subset_of_issues(&self) -> bool {
        let issue_keys: BTreeSet<(String, String)> = self
            .validation_result
            .issues
            .iter()
            .map(ValidationIssue::fingerprint_key)
            .collect();
        self.auto_fixable_issues
            .iter()
            .chain(self.user_input_required_issues.iter())
            .all(|issue| issue_keys.contains(&issue.fingerprint_key()))
    }
}

/// A static rule deciding whether a given check is auto-fixable without
/// consulting the LLM. Static rules always win over an LLM classification
/// in a conflict.
pub struct AutoFixRule {
    pub check_name: &'static str,
    pub auto_fixable: bool,
    pub reason: &'static str,
}

/// The built-in safe fixes the Conversion Agent applies during
/// reconversion: defaulting missing optional metadata, converting known
/// equivalent units, inferring timestamps from file headers, generating
/// descriptions from field names, plus the hard rule that missing required
/// metadata is never auto-fixable.
pub const AUTO_FIX_RULES: &[AutoFixRule] = &[
    AutoFixRule {
        check_name: "check_missing_optional_metadata",
        auto_fixable: true,
        reason: "a safe default exists for optional fields",
    },
    AutoFixRule {
        check_name: "check_unit_mismatch",
        auto_fixable: true,
        reason: "known equivalent unit conversions are applied automatically",
    },
    AutoFixRule {
        check_name: "check_missing_timestamps",
        auto_fixable: true,
        reason: "timestamps can be inferred from the recording's file headers",
    },
    AutoFixRule {
        check_name: "check_missing_description",
        auto_fixable: true,
        reason: "a description can be generated from the field name",
    },
    AutoFixRule {
        check_name: "check_missing_required_metadata",
        auto_fixable: false,
        reason: "required metadata always needs a user-supplied value",
    },
    AutoFixRule {
        check_name: "check_missing_subject_id",
        auto_fixable: false,
        reason: "required metadata always needs a user-supplied value",
    },
];

/// Classify one issue as auto-fixable or user-input-required. The static
/// ruleset is consulted first; if no rule matches the check name, the
/// LLM's recommendation (if any) is used; absent both, CRITICAL/ERROR
/// issues default to user-input-required and lesser severities default to
/// auto-fixable, the conservative default.
pub fn classify_issue(issue: &ValidationIssue, llm_says_auto_fixable: Option<bool>) -> bool {
    if let Some(rule) = AUTO_FIX_RULES.iter().find(|r| r.check_name == issue.check_name) {
        return rule.auto_fixable;
    }
    if let Some(llm_verdict) = llm_says_auto_fixable {
        return llm_verdict;
    }
    !issue.severity.blocks_pass() || matches!(issue.severity, Severity::Warning)
}

/// The `{(check_name, location)}` set of an attempt's issues, used to
/// detect whether a new attempt made no progress.
pub type IssueFingerprint = BTreeSet<(String, String)>;

pub fn fingerprint_of(issues: &[ValidationIssue]) -> IssueFingerprint {
    issues.iter().map(ValidationIssue::fingerprint_key).collect()
}

/// Tracks whether successive attempts are making progress. Unlike a tiered
/// escalation loop, this guard never blocks retries — it only ever produces
/// an advisory the caller may act on.
#[derive(Debug, Clone, Default)]
pub struct NoProgressGuard {
    previous_fingerprint: Option<IssueFingerprint>,
    user_input_supplied_since_last: bool,
    new_auto_fix_available: bool,
}

impl NoProgressGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the user supplied input for the current pending attempt.
    pub fn note_user_input_supplied(&mut self) {
        self.user_input_supplied_since_last = true;
    }

    /// Record that a new auto-fix rule became applicable since the last check.
    pub fn note_new_auto_fix_available(&mut self) {
        self.new_auto_fix_available = true;
    }

    /// Evaluate the guard against a freshly built `CorrectionContext`.
    /// Returns `Some(message)` when a no-progress warning should be
    /// surfaced: an identical issue fingerprint across consecutive attempts.
    pub fn check(&mut self, current: &CorrectionContext) -> Option<String> {
        let current_fingerprint = fingerprint_of(&current.validation_result.issues);

        let warning = match &self.previous_fingerprint {
            Some(previous) if previous == &current_fingerprint => {
                if self.user_input_supplied_since_last || self.new_auto_fix_available {
                    None
                } else {
                    Some(
                        "No changes detected since last attempt. Retry will likely produce the same errors."
                            .to_string(),
                    )
                }
            }
            _ => None,
        };

        self.previous_fingerprint = Some(current_fingerprint);
        self.user_input_supplied_since_last = false;
        self.new_auto_fix_available = false;

        warning
    }
}
