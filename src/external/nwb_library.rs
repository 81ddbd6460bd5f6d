//! Port to the underlying NWB validation library: runs checks and returns
//! structured issue lists.

use async_trait::async_trait;
use std::path::Path;

use crate::validation::{FileInfo, ValidationIssue};

#[derive(Debug, Clone)]
pub struct LibraryError(pub String);

/// Port to the NWB library: readability gate plus the inspector run.
#[async_trait]
pub trait NwbLibraryPort: Send + Sync {
    /// Open the file. Failure here means the schema gate is violated.
    async fn can_open(&self, nwb_path: &Path) -> Result<FileInfo, LibraryError>;

    /// Run the inspector with all checks enabled, returning raw issues.
    async fn run_inspector(&self, nwb_path: &Path) -> Result<Vec<ValidationIssue>, LibraryError>;
}

/// Deterministic in-memory double: a file is "openable" unless it is
/// missing, and its issue list is whatever the test fixture configured —
/// swapping the real inspector's heuristics for direct test control.
pub struct MockNwbLibrary {
    pub file_info: FileInfo,
    pub issues: Vec<ValidationIssue>,
}

impl Default for MockNwbLibrary {
    fn default() -> Self {
        Self {
            file_info: FileInfo {
                nwb_version: "2.6.0".to_string(),
                sampling_rate_hz: Some(30_000.0),
                channel_count: Some(16),
                duration_seconds: Some(5.0),
                dtype: Some("int16".to_string()),
            },
            issues: Vec::new(),
        }
    }
}

#[async_trait]
impl NwbLibraryPort for MockNwbLibrary {
    async fn can_open(&self, nwb_path: &Path) -> Result<FileInfo, LibraryError> {
        if !nwb_path.exists() {
            return Err(LibraryError(format!("no such file: {}", nwb_path.display())));
        }
        Ok(self.file_info.clone())
    }

    async fn run_inspector(&self, _nwb_path: &Path) -> Result<Vec<ValidationIssue>, LibraryError> {
        Ok(self.issues.clone())
    }
}
