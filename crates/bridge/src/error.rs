use std::path::PathBuf;

use retexturity_core::error::CoreError;

/// Errors surfaced to the host application.
///
/// Messages are written to be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid workflow: {0}")]
    InvalidTemplateFormat(String),

    #[error("Workflow error: {0}")]
    Template(String),

    #[error("Could not connect to ComfyUI at {0}. Check the service URL.")]
    ConnectionFailure(String),

    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),

    #[error("Upload failed: {0}")]
    UploadError(String),

    #[error("Workflow rejected by ComfyUI: {0}")]
    SubmitRejected(String),

    #[error("Could not determine result file: {0}")]
    ArtifactNotFound(String),

    #[error("Failed to write {}: {reason}", path.display())]
    StageWriteError { path: PathBuf, reason: String },

    #[error("A generation is already running")]
    AlreadyRunning,

    #[error("Gave up waiting for job {prompt_id} after {attempts} polls")]
    Timeout { prompt_id: String, attempts: u32 },

    #[error("ComfyUI reported a failed execution for job {0}")]
    ExecutionFailed(String),

    #[error("View capture failed: {0}")]
    Capture(String),

    #[error("Import failed: {0}")]
    Import(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CoreError> for BridgeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTemplateFormat(msg) => Self::InvalidTemplateFormat(msg),
            other => Self::Template(other.to_string()),
        }
    }
}
