//! Job-level operations against a generation service.
//!
//! [`JobApi`] is the seam between the bridge's polling logic and the
//! transport. [`ComfyUIApi`] implements it over HTTP; tests substitute an
//! in-memory fake.

use std::path::Path;

use async_trait::async_trait;
use retexturity_core::types::RemoteAsset;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::HistoryEntry;

/// Stateless protocol operations used by a job run.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Whether the service is reachable. Never fails.
    async fn probe(&self) -> bool;

    /// Upload a local file, returning its server-side name.
    async fn upload_asset(
        &self,
        path: &Path,
        subfolder: &str,
        kind: &str,
    ) -> Result<RemoteAsset, ComfyUIApiError>;

    /// Queue a workflow graph and return its job (prompt) ID.
    async fn submit(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError>;

    /// History entry for a job, or `None` while it is still running.
    async fn query_status(&self, job_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;

    /// Raw bytes of an output file.
    async fn download_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError>;
}

#[async_trait]
impl JobApi for ComfyUIApi {
    async fn probe(&self) -> bool {
        ComfyUIApi::probe(self).await
    }

    async fn upload_asset(
        &self,
        path: &Path,
        subfolder: &str,
        kind: &str,
    ) -> Result<RemoteAsset, ComfyUIApiError> {
        self.upload_image(path, subfolder, kind).await
    }

    async fn submit(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        self.submit_workflow(graph, client_id).await
    }

    async fn query_status(&self, job_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.get_history(job_id).await
    }

    async fn download_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        self.view(filename, subfolder, kind).await
    }
}
