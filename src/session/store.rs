//! Single-session state store.
//!
//! All mutation of `SessionState` is serialized through one logical lane —
//! here, a `tokio::sync::Mutex` guarding the single process-global
//! session. External callers that only need to read obtain an immutable
//! snapshot (a deep clone) rather than a reference into the guarded state,
//! so readers (the status API, the WebSocket-equivalent bridge) never
//! block a handler mid-mutation and never observe a half-updated session.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::types::{
    AttemptSummary, SessionState, SessionStatus, StageName, UserMetadata, ValidationStatus,
};
use crate::errors::SessionBusy;

/// Shared reference to the session store, handed to every agent.
pub type SharedSessionStore = Arc<SessionStore>;

/// Owns the single mutable session behind a single-writer mutation lane,
/// the same shape as a single-writer state store minus persistence: durable
/// storage is out of scope, so the lane guards an in-memory value only.
pub struct SessionStore {
    inner: Mutex<SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionState::idle()),
        }
    }

    pub fn shared(self) -> SharedSessionStore {
        Arc::new(self)
    }

    /// An immutable projection of the current session. Safe to call from
    /// any reader without waiting on in-flight handler work, beyond the
    /// brief lock needed to clone.
    pub async fn get_snapshot(&self) -> SessionState {
        self.inner.lock().await.clone()
    }

    /// Digest of the current snapshot, for `ErrorEnvelope.state_snapshot_digest`.
    pub async fn snapshot_digest(&self) -> String {
        let snapshot = self.get_snapshot().await;
        digest_of(&snapshot)
    }

    /// Atomically test `status == idle` and flip to `processing`. Rejects
    /// with `SessionBusy` if a session is already in flight, without
    /// mutating state.
    pub async fn begin(
        &self,
        input_path: impl Into<String>,
        metadata: UserMetadata,
    ) -> Result<(), SessionBusy> {
        let mut state = self.inner.lock().await;
        if state.status != SessionStatus::Idle {
            return Err(SessionBusy);
        }
        state.begin(input_path, metadata);
        Ok(())
    }

    pub async fn start_stage(&self, name: StageName) {
        self.inner.lock().await.start_stage(name);
    }

    pub async fn complete_stage(&self, name: StageName, output_path: Option<String>) {
        self.inner.lock().await.complete_stage(name, output_path);
    }

    pub async fn fail_stage(&self, name: StageName, error: impl Into<String>) {
        self.inner.lock().await.fail_stage(name, error);
    }

    pub async fn record_checksum(&self, checksum_sha256: impl Into<String>) {
        self.inner.lock().await.record_checksum(checksum_sha256);
    }

    pub async fn set_validation(&self, status: ValidationStatus) {
        self.inner.lock().await.set_validation(status);
    }

    pub async fn record_attempt(
        &self,
        issues_before: usize,
        issues_after: usize,
        user_decision: Option<String>,
    ) -> AttemptSummary {
        let mut state = self.inner.lock().await;
        state.record_attempt(issues_before, issues_after, user_decision.clone());
        state.history.last().cloned().expect("just pushed")
    }

    pub async fn begin_new_attempt(&self) -> u32 {
        let mut state = self.inner.lock().await;
        state.begin_new_attempt();
        state.attempt_number
    }

    pub async fn set_awaiting_decision(&self, awaiting: bool) {
        self.inner.lock().await.awaiting_user_decision = awaiting;
    }

    pub async fn set_awaiting_input(&self, fields: Vec<String>) {
        self.inner.lock().await.awaiting_user_input = fields;
    }

    pub async fn set_output_path(&self, path: impl Into<String>) {
        self.inner.lock().await.output_path = Some(path.into());
    }

    pub async fn finalize(&self, terminal_status: SessionStatus) {
        self.inner.lock().await.finalize(terminal_status);
    }

    /// Full reset, but only valid from `idle` or a terminal status — a reset
    /// may be requested from idle or terminal states only, never
    /// mid-processing.
    pub async fn reset(&self) -> bool {
        let mut state = self.inner.lock().await;
        if matches!(
            state.status,
            SessionStatus::Idle | SessionStatus::Completed | SessionStatus::Failed
        ) {
            state.reset();
            true
        } else {
            false
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn digest_of<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
