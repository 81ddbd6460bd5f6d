//! Core types for the single in-flight conversion session.
//!
//! These mirror the shape of a persisted coordination record, but the
//! session here is in-memory only — durable storage is out of scope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a session. One process has at most one active
/// session at a time, but the id still lets logs and reports name it
/// unambiguously across a reset.
pub type SessionId = String;

/// Top-level conversion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Processing,
    Completed,
    Failed,
}

/// Terminal/awaiting classification of validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Unset,
    Passed,
    PassedAccepted,
    PassedImproved,
    FailedUserDeclined,
    FailedUserAbandoned,
}

impl ValidationStatus {
    /// Terminal validation statuses always resolve away from `Unset`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

/// Name of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Conversion,
    Evaluation,
    ReportGeneration,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversion => write!(f, "conversion"),
            Self::Evaluation => write!(f, "evaluation"),
            Self::ReportGeneration => write!(f, "report_generation"),
        }
    }
}

/// Status of a single stage within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One entry in `SessionState.stages[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    pub attempt_number: u32,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

impl Stage {
    pub fn new_pending(name: StageName, attempt_number: u32) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            attempt_number,
            start: None,
            end: None,
            output_path: None,
            error: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = StageStatus::InProgress;
        self.start = Some(Utc::now());
    }

    pub fn complete(&mut self, output_path: Option<String>) {
        self.status = StageStatus::Completed;
        self.end = Some(Utc::now());
        self.output_path = output_path;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StageStatus::Failed;
        self.end = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// User-supplied NWB metadata bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetadata {
    pub subject_id: Option<String>,
    pub species: Option<String>,
    pub session_description: Option<String>,
    pub session_start_time: Option<String>,
    pub experimenter: Option<String>,
    pub institution: Option<String>,
    pub lab: Option<String>,
    pub age: Option<String>,
    pub sex: Option<String>,
    pub weight: Option<String>,
}

/// A single structured, append-only log entry.
///
/// Using a typed enum (rather than free-text) is what makes
/// `SessionState::replay` possible: replaying the
/// log must reconstruct `{status, validation_status, attempt_number,
/// stages[], checksums}` exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    SessionStarted {
        timestamp: DateTime<Utc>,
        input_path: String,
    },
    StageTransition {
        timestamp: DateTime<Utc>,
        stage: StageName,
        status: StageStatus,
        attempt_number: u32,
    },
    AttemptChecksum {
        timestamp: DateTime<Utc>,
        attempt_number: u32,
        checksum_sha256: String,
    },
    ValidationSet {
        timestamp: DateTime<Utc>,
        status: ValidationStatus,
    },
    AttemptRecorded {
        timestamp: DateTime<Utc>,
        attempt_number: u32,
        issues_before: usize,
        issues_after: usize,
        user_decision: Option<String>,
    },
    Finalized {
        timestamp: DateTime<Utc>,
        terminal_status: SessionStatus,
    },
    Message {
        timestamp: DateTime<Utc>,
        message: String,
    },
}

impl LogEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { timestamp, .. }
            | Self::StageTransition { timestamp, .. }
            | Self::AttemptChecksum { timestamp, .. }
            | Self::ValidationSet { timestamp, .. }
            | Self::AttemptRecorded { timestamp, .. }
            | Self::Finalized { timestamp, .. }
            | Self::Message { timestamp, .. } => *timestamp,
        }
    }
}

/// Summary of a single completed attempt, appended to `history[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_number: u32,
    pub issues_before: usize,
    pub issues_after: usize,
    pub user_decision: Option<String>,
}

/// The single, process-global session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub validation_status: ValidationStatus,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub metadata: UserMetadata,
    pub stages: Vec<Stage>,
    pub logs: Vec<LogEntry>,
    pub timestamps: HashMap<String, DateTime<Utc>>,
    pub attempt_number: u32,
    pub checksums: HashMap<u32, String>,
    pub history: Vec<AttemptSummary>,
    pub awaiting_user_decision: bool,
    pub awaiting_user_input: Vec<String>,
    pub error_message: Option<String>,
}

impl SessionState {
    /// A fresh, idle session.
    pub fn idle() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Idle,
            validation_status: ValidationStatus::Unset,
            input_path: None,
            output_path: None,
            metadata: UserMetadata::default(),
            stages: Vec::new(),
            logs: Vec::new(),
            timestamps: HashMap::new(),
            attempt_number: 0,
            checksums: HashMap::new(),
            history: Vec::new(),
            awaiting_user_decision: false,
            awaiting_user_input: Vec::new(),
            error_message: None,
        }
    }

    /// Invariant check: at most one stage `in_progress` at a time.
    pub fn at_most_one_in_progress(&self) -> bool {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::InProgress)
            .count()
            <= 1
    }

    /// The stage currently in progress for the current attempt, if any.
    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .rev()
            .find(|s| s.status == StageStatus::InProgress)
    }

    fn record(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn begin(&mut self, input_path: impl Into<String>, metadata: UserMetadata) {
        let input_path = input_path.into();
        self.status = SessionStatus::Processing;
        self.input_path = Some(input_path.clone());
        self.metadata = metadata;
        self.timestamps.insert("begin".to_string(), Utc::now());
        self.record(LogEntry::SessionStarted {
            timestamp: Utc::now(),
            input_path,
        });
    }

    /// Start a fresh pending stage for the current attempt number, or
    /// reopen one after a prior failed attempt.
    pub fn start_stage(&mut self, name: StageName) {
        let attempt_number = self.attempt_number;
        let mut stage = Stage::new_pending(name, attempt_number);
        stage.begin();
        self.record(LogEntry::StageTransition {
            timestamp: Utc::now(),
            stage: name,
            status: StageStatus::InProgress,
            attempt_number,
        });
        self.stages.push(stage);
    }

    fn last_stage_mut(&mut self, name: StageName) -> Option<&mut Stage> {
        let attempt = self.attempt_number;
        self.stages
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.attempt_number == attempt)
    }

    pub fn complete_stage(&mut self, name: StageName, output_path: Option<String>) {
        let attempt_number = self.attempt_number;
        if let Some(stage) = self.last_stage_mut(name) {
            stage.complete(output_path);
        }
        self.record(LogEntry::StageTransition {
            timestamp: Utc::now(),
            stage: name,
            status: StageStatus::Completed,
            attempt_number,
        });
    }

    pub fn fail_stage(&mut self, name: StageName, error: impl Into<String>) {
        let attempt_number = self.attempt_number;
        let error = error.into();
        if let Some(stage) = self.last_stage_mut(name) {
            stage.fail(error.clone());
        }
        self.record(LogEntry::StageTransition {
            timestamp: Utc::now(),
            stage: name,
            status: StageStatus::Failed,
            attempt_number,
        });
        self.error_message = Some(error);
    }

    pub fn record_checksum(&mut self, checksum_sha256: impl Into<String>) {
        let attempt_number = self.attempt_number;
        let checksum = checksum_sha256.into();
        self.checksums.insert(attempt_number, checksum.clone());
        self.record(LogEntry::AttemptChecksum {
            timestamp: Utc::now(),
            attempt_number,
            checksum_sha256: checksum,
        });
    }

    pub fn set_validation(&mut self, status: ValidationStatus) {
        self.validation_status = status;
        self.record(LogEntry::ValidationSet {
            timestamp: Utc::now(),
            status,
        });
    }

    pub fn record_attempt(
        &mut self,
        issues_before: usize,
        issues_after: usize,
        user_decision: Option<String>,
    ) {
        let attempt_number = self.attempt_number;
        self.history.push(AttemptSummary {
            attempt_number,
            issues_before,
            issues_after,
            user_decision: user_decision.clone(),
        });
        self.record(LogEntry::AttemptRecorded {
            timestamp: Utc::now(),
            attempt_number,
            issues_before,
            issues_after,
            user_decision,
        });
    }

    /// Begin a new attempt.
    pub fn begin_new_attempt(&mut self) {
        self.attempt_number += 1;
    }

    pub fn finalize(&mut self, terminal_status: SessionStatus) {
        self.status = terminal_status;
        self.awaiting_user_decision = false;
        self.awaiting_user_input.clear();
        self.record(LogEntry::Finalized {
            timestamp: Utc::now(),
            terminal_status,
        });
    }

    /// Full reset to idle, clearing logs/history/checksums.
    pub fn reset(&mut self) {
        *self = Self::idle();
    }

    /// Replay a log into a fresh session, reconstructing the projection
    /// `{status, validation_status, attempt_number, stages[], checksums}`
    /// that a full log replay must produce.
    pub fn replay(log: &[LogEntry]) -> Self {
        let mut state = Self::idle();
        for entry in log {
            match entry {
                LogEntry::SessionStarted { input_path, .. } => {
                    state.status = SessionStatus::Processing;
                    state.input_path = Some(input_path.clone());
                }
                LogEntry::StageTransition {
                    stage,
                    status,
                    attempt_number,
                    ..
                } => {
                    state.attempt_number = state.attempt_number.max(*attempt_number);
                    match status {
                        StageStatus::InProgress => {
                            state.stages.push(Stage {
                                name: *stage,
                                status: StageStatus::InProgress,
                                attempt_number: *attempt_number,
                                start: Some(entry.timestamp()),
                                end: None,
                                output_path: None,
                                error: None,
                            });
                        }
                        StageStatus::Completed | StageStatus::Failed => {
                            if let Some(existing) = state.stages.iter_mut().rev().find(|s| {
                                s.name == *stage
                                    && s.attempt_number == *attempt_number
                                    && s.status == StageStatus::InProgress
                            }) {
                                existing.status = *status;
                                existing.end = Some(entry.timestamp());
                            }
                        }
                        StageStatus::Pending => {}
                    }
                }
                LogEntry::AttemptChecksum {
                    attempt_number,
                    checksum_sha256,
                    ..
                } => {
                    state
                        .checksums
                        .insert(*attempt_number, checksum_sha256.clone());
                }
                LogEntry::ValidationSet { status, .. } => {
                    state.validation_status = *status;
                }
                LogEntry::AttemptRecorded {
                    attempt_number,
                    issues_before,
                    issues_after,
                    user_decision,
                    ..
                } => {
                    state.history.push(AttemptSummary {
                        attempt_number: *attempt_number,
                        issues_before: *issues_before,
                        issues_after: *issues_after,
                        user_decision: user_decision.clone(),
                    });
                }
                LogEntry::Finalized { terminal_status, .. } => {
                    state.status = *terminal_status;
                }
                LogEntry::Message { .. } => {}
            }
        }
        state.logs = log.to_vec();
        state
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::idle()
    }
}
