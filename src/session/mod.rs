//! Session Store — the single in-flight conversion session.

pub mod store;
pub mod types;

pub use store::{SessionStore, SharedSessionStore};
pub use types::{
    AttemptSummary, LogEntry, SessionId, SessionState, SessionStatus, Stage, StageName,
    StageStatus, UserMetadata, ValidationStatus,
};
