//! Port to the underlying conversion library, invoked as an opaque
//! service. Provides format auto-detection, interface instantiation, and
//! NWB writing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One candidate recording-system interface the library's auto-detect proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceCandidate {
    pub interface_name: String,
    pub confidence: f32,
}

/// Technical metadata auto-extracted from the recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTechnicalMetadata {
    pub sampling_rate_hz: Option<f64>,
    pub channel_count: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub dtype: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutcome {
    pub output_path: String,
    pub technical_metadata: ExtractedTechnicalMetadata,
}

/// Opaque error text from the conversion library, preserved in full when
/// raising `ConversionError`.
#[derive(Debug, Clone)]
pub struct LibraryError(pub String);

/// Port to the external conversion library.
#[async_trait]
pub trait ConversionLibraryPort: Send + Sync {
    /// Return candidate interfaces with confidence scores for a directory.
    async fn detect_format(&self, input_dir: &Path) -> Result<Vec<InterfaceCandidate>, LibraryError>;

    /// Instantiate the chosen interface and write an NWB file to `output_path`,
    /// merging auto-extracted technical metadata with `user_metadata`.
    async fn convert(
        &self,
        input_dir: &Path,
        interface_name: &str,
        output_path: &Path,
        user_metadata: &HashMap<String, String>,
    ) -> Result<ConversionOutcome, LibraryError>;
}

/// Deterministic in-memory double for tests: treats every directory as a
/// single-candidate SpikeGLX recording and writes a placeholder file
/// instead of a real NWB binary, since the real writer is out of scope.
pub struct MockConversionLibrary {
    pub candidates: Vec<InterfaceCandidate>,
    pub technical_metadata: ExtractedTechnicalMetadata,
}

impl Default for MockConversionLibrary {
    fn default() -> Self {
        Self {
            candidates: vec![InterfaceCandidate {
                interface_name: "SpikeGLXRecordingInterface".to_string(),
                confidence: 0.97,
            }],
            technical_metadata: ExtractedTechnicalMetadata {
                sampling_rate_hz: Some(30_000.0),
                channel_count: Some(16),
                duration_seconds: Some(5.0),
                dtype: Some("int16".to_string()),
            },
        }
    }
}

#[async_trait]
impl ConversionLibraryPort for MockConversionLibrary {
    async fn detect_format(&self, _input_dir: &Path) -> Result<Vec<InterfaceCandidate>, LibraryError> {
        Ok(self.candidates.clone())
    }

    async fn convert(
        &self,
        _input_dir: &Path,
        interface_name: &str,
        output_path: &Path,
        _user_metadata: &HashMap<String, String>,
    ) -> Result<ConversionOutcome, LibraryError> {
        std::fs::write(output_path, format!("NWB placeholder via {interface_name}"))
            .map_err(|e| LibraryError(e.to_string()))?;
        Ok(ConversionOutcome {
            output_path: output_path.display().to_string(),
            technical_metadata: self.technical_metadata.clone(),
        })
    }
}
