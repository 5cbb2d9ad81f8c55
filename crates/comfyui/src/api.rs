//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (connectivity probe, image upload, workflow
//! submission, history retrieval, output download) using [`reqwest`].
//! None of the calls retry on failure.

use std::path::{Path, PathBuf};

use reqwest::multipart::{Form, Part};
use retexturity_core::types::RemoteAsset;
use serde::Deserialize;

use crate::history::HistoryEntry;

/// Default folder type for uploads.
pub const UPLOAD_KIND_INPUT: &str = "input";

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint.
///
/// `prompt_id` is absent when the server rejects the graph (it then
/// reports `error` / `node_errors` instead).
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A local file to upload does not exist.
    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),

    /// Reading a local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server accepted the request but returned no prompt ID.
    #[error("Workflow rejected by ComfyUI: {0}")]
    SubmitRejected(String),

    /// The response body did not have the expected shape.
    #[error("Unexpected ComfyUI response: {0}")]
    InvalidResponse(String),
}

impl ComfyUIApiError {
    /// Whether the failure happened before ComfyUI produced a response.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_connect() || e.is_timeout())
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`. A
    ///   trailing slash is stripped.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for custom timeouts or connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Check that the server is reachable.
    ///
    /// Sends `GET /system_stats`. Never fails: any error, including a
    /// non-2xx status, yields `false`.
    pub async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!(api_url = %self.api_url, error = %e, "ComfyUI probe failed");
                false
            }
        }
    }

    /// Upload a local image into the server's input folder.
    ///
    /// Sends a multipart `POST /upload/image` with parts `image`,
    /// `subfolder` (only when non-empty) and `type`.
    pub async fn upload_image(
        &self,
        path: &Path,
        subfolder: &str,
        kind: &str,
    ) -> Result<RemoteAsset, ComfyUIApiError> {
        if !path.is_file() {
            return Err(ComfyUIApiError::AssetNotFound(path.to_path_buf()));
        }

        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.png".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(guess_mime(path))?;

        let mut form = Form::new().part("image", part);
        if !subfolder.is_empty() {
            form = form.text("subfolder", subfolder.to_string());
        }
        form = form.text("type", kind.to_string());

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let asset: RemoteAsset = Self::parse_response(response).await?;
        tracing::info!(
            local = %path.display(),
            remote = %asset.name,
            subfolder = %asset.subfolder,
            "Uploaded asset to ComfyUI",
        );
        Ok(asset)
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID, returning the server-assigned `prompt_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let raw: serde_json::Value = Self::parse_response(response).await?;
        let parsed: SubmitResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))?;

        match parsed.prompt_id {
            Some(prompt_id) => {
                tracing::info!(
                    prompt_id = %prompt_id,
                    queue_number = ?parsed.number,
                    "Workflow submitted to ComfyUI",
                );
                Ok(prompt_id)
            }
            None => Err(ComfyUIApiError::SubmitRejected(raw.to_string())),
        }
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. ComfyUI answers with an
    /// object keyed by prompt ID that is empty until the prompt finishes,
    /// which maps to `Ok(None)`.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let raw: serde_json::Value = Self::parse_response(response).await?;
        HistoryEntry::from_history_response(&raw, prompt_id)
            .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    /// Download an output file.
    ///
    /// Sends `GET /view?filename=..&subfolder=..&type=..` and returns the
    /// raw bytes.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// MIME type for an upload, from the file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("exr") => "image/x-exr",
        Some("tga") => "image/x-tga",
        Some("glb") => "model/gltf-binary",
        Some("gltf") => "model/gltf+json",
        Some("obj") => "model/obj",
        _ => "application/octet-stream",
    }
}
