#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use retexturity_bridge::collaborators::{
    ArtifactImporter, ArtifactKind, CompletionNotifier, ViewCapture,
};
use retexturity_bridge::config::BridgeConfig;
use retexturity_bridge::controller::JobController;
use retexturity_bridge::error::BridgeError;
use retexturity_comfyui::api::ComfyUIApiError;
use retexturity_comfyui::history::HistoryEntry;
use retexturity_comfyui::job_api::JobApi;
use retexturity_core::template::{parse_template, JobTemplate};
use retexturity_core::types::RemoteAsset;
use serde_json::json;
use tokio::sync::Notify;

/// Network call recorded by [`FakeApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Probe,
    Upload(PathBuf),
    Submit,
    Status(String),
    Download(String),
}

/// Scripted reply to a status query.
#[derive(Debug, Clone)]
pub enum HistoryReply {
    Pending,
    Unreachable,
    /// History entry JSON (`{"outputs": ..., "status": ...}`).
    Ready(serde_json::Value),
}

/// Parks a fake call until the test lets it through.
#[derive(Clone, Default)]
pub struct Gate {
    /// Signalled once the call has been recorded and is waiting.
    pub entered: Arc<Notify>,
    /// Signal to let the waiting call continue.
    pub release: Arc<Notify>,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// In-memory [`JobApi`] that records every call.
///
/// Status queries pop scripted replies; once the script is exhausted the
/// job stays pending.
#[derive(Default)]
pub struct FakeApi {
    unreachable: bool,
    reject_submit: Option<String>,
    history: Mutex<VecDeque<HistoryReply>>,
    download: Option<Vec<u8>>,
    calls: Mutex<Vec<Call>>,
    submitted: Mutex<Vec<serde_json::Value>>,
    submit_gate: Option<Gate>,
    status_gate: Option<Gate>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn rejecting(mut self, body: &str) -> Self {
        self.reject_submit = Some(body.to_string());
        self
    }

    pub fn with_history(self, replies: Vec<HistoryReply>) -> Self {
        *self.history.lock().unwrap() = replies.into();
        self
    }

    pub fn with_download(mut self, bytes: &[u8]) -> Self {
        self.download = Some(bytes.to_vec());
        self
    }

    /// Hold every `submit` call at `gate`.
    pub fn with_submit_gate(mut self, gate: Gate) -> Self {
        self.submit_gate = Some(gate);
        self
    }

    /// Hold every `query_status` call at `gate`.
    pub fn with_status_gate(mut self, gate: Gate) -> Self {
        self.status_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Graphs passed to `submit`, in order.
    pub fn submitted(&self) -> Vec<serde_json::Value> {
        self.submitted.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl JobApi for FakeApi {
    async fn probe(&self) -> bool {
        self.record(Call::Probe);
        !self.unreachable
    }

    async fn upload_asset(
        &self,
        path: &Path,
        subfolder: &str,
        kind: &str,
    ) -> Result<RemoteAsset, ComfyUIApiError> {
        self.record(Call::Upload(path.to_path_buf()));
        if !path.is_file() {
            return Err(ComfyUIApiError::AssetNotFound(path.to_path_buf()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RemoteAsset {
            name: format!("remote_{name}"),
            subfolder: subfolder.to_string(),
            kind: kind.to_string(),
        })
    }

    async fn submit(
        &self,
        graph: &serde_json::Value,
        _client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        self.record(Call::Submit);
        self.submitted.lock().unwrap().push(graph.clone());
        if let Some(gate) = &self.submit_gate {
            gate.pass().await;
        }
        match &self.reject_submit {
            Some(body) => Err(ComfyUIApiError::SubmitRejected(body.clone())),
            None => Ok("prompt-1".to_string()),
        }
    }

    async fn query_status(&self, job_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.record(Call::Status(job_id.to_string()));
        if let Some(gate) = &self.status_gate {
            gate.pass().await;
        }
        let reply = self
            .history
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HistoryReply::Pending);
        match reply {
            HistoryReply::Pending => Ok(None),
            HistoryReply::Unreachable => Err(ComfyUIApiError::InvalidResponse(
                "connection reset".to_string(),
            )),
            HistoryReply::Ready(entry) => Ok(Some(
                serde_json::from_value(entry)
                    .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))?,
            )),
        }
    }

    async fn download_artifact(
        &self,
        filename: &str,
        _subfolder: &str,
        _kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        self.record(Call::Download(filename.to_string()));
        self.download.clone().ok_or(ComfyUIApiError::ApiError {
            status: 404,
            body: "not found".to_string(),
        })
    }
}

/// Writes a small PNG-named file on every capture.
pub struct FakeCapture {
    dir: PathBuf,
    count: AtomicUsize,
}

impl FakeCapture {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ViewCapture for FakeCapture {
    fn capture_view(&self) -> Result<PathBuf, BridgeError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join("viewport.png");
        std::fs::write(&path, b"png").map_err(|e| BridgeError::Capture(e.to_string()))?;
        Ok(path)
    }
}

#[derive(Default)]
pub struct RecordingImporter {
    pub imported: Mutex<Vec<(PathBuf, ArtifactKind)>>,
}

impl ArtifactImporter for RecordingImporter {
    fn import(&self, path: &Path, kind: ArtifactKind) -> Result<(), BridgeError> {
        self.imported
            .lock()
            .unwrap()
            .push((path.to_path_buf(), kind));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notified: Mutex<Vec<PathBuf>>,
}

impl CompletionNotifier for RecordingNotifier {
    fn notify(&self, artifact: &Path) {
        self.notified.lock().unwrap().push(artifact.to_path_buf());
    }
}

/// Three-node image workflow: load image (1) -> sampler (2) -> save (3).
pub fn sample_template() -> JobTemplate {
    parse_template(&json!({
        "1": {
            "class_type": "LoadImage",
            "inputs": { "image": "placeholder.png" },
            "_meta": { "title": "Load Image" }
        },
        "2": {
            "class_type": "KSampler",
            "inputs": { "seed": 5, "steps": 20, "cfg": 7.5, "model": ["1", 0] },
            "_meta": { "title": "Sampler" }
        },
        "3": {
            "class_type": "SaveImage",
            "inputs": { "images": ["2", 0], "filename_prefix": "ComfyUI" },
            "_meta": { "title": "Save Image" }
        }
    }))
    .unwrap()
}

/// History entry JSON with one image output on node 3.
pub fn image_output(filename: &str) -> serde_json::Value {
    json!({
        "outputs": {
            "3": { "images": [{ "filename": filename, "subfolder": "", "type": "output" }] }
        },
        "status": { "status_str": "success", "completed": true }
    })
}

/// Config staging into `output_dir`, with a fast poll interval.
pub fn test_config(output_dir: &Path, comfyui_output_dir: Option<&Path>) -> BridgeConfig {
    BridgeConfig {
        output_dir: output_dir.to_path_buf(),
        comfyui_output_dir: comfyui_output_dir.map(Path::to_path_buf),
        poll_interval: Duration::from_millis(10),
        max_poll_attempts: 20,
        ..BridgeConfig::default()
    }
}

pub fn controller(api: &Arc<FakeApi>, config: BridgeConfig) -> JobController {
    JobController::new(Arc::clone(api) as Arc<dyn JobApi>, config)
}
