//! Generation run lifecycle.
//!
//! [`JobController::start`] performs the blocking part of a run: probe,
//! capture or image uploads, merge, submit. It returns a [`PollTask`] that
//! checks the job once per tick. Hosts either call [`PollTask::tick`] from
//! their own timer or hand the task to [`PollTask::run`] /
//! [`PollTask::spawn`], which drive it on a Tokio interval.
//!
//! Only one run may be active per controller. Cancelling stops local
//! polling immediately; the job keeps running on the ComfyUI server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use retexturity_comfyui::api::{ComfyUIApi, ComfyUIApiError, UPLOAD_KIND_INPUT};
use retexturity_comfyui::history::OutputFile;
use retexturity_comfyui::job_api::JobApi;
use retexturity_core::parameters::{
    has_any_local_image_override, inject_uploaded_image, merge, OverrideValue, ParameterOverride,
};
use retexturity_core::template::JobTemplate;
use retexturity_core::types::Timestamp;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::{ArtifactImporter, ArtifactKind, CompletionNotifier, ViewCapture};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::BridgeEvent;
use crate::resolver::{ArtifactSource, Located, ResolvedArtifact, ResolverState, ResultResolver};

/// Broadcast channel capacity for run events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// State shared between the controller and its poll task.
#[derive(Debug, Default)]
pub struct ControllerState {
    active: Option<ActiveRun>,
    latest_artifact: Option<PathBuf>,
}

#[derive(Debug)]
struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

impl ControllerState {
    pub fn is_generating(&self) -> bool {
        self.active.is_some()
    }

    pub fn latest_artifact(&self) -> Option<&Path> {
        self.latest_artifact.as_deref()
    }

    fn is_active(&self, run_id: Uuid) -> bool {
        self.active.as_ref().is_some_and(|run| run.id == run_id)
    }

    /// Clear the active run if it is still `run_id`.
    fn release(&mut self, run_id: Uuid) {
        if self.is_active(run_id) {
            self.active = None;
        }
    }
}

/// Inputs for one generation run.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub template: &'a JobTemplate,
    pub overrides: &'a [ParameterOverride],
    /// Node that receives the captured view.
    pub input_node_id: Option<&'a str>,
    /// Node whose outputs hold the artifact.
    pub output_node_id: Option<&'a str>,
}

/// Identity of a submitted run.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub run_id: Uuid,
    pub prompt_id: String,
    pub client_id: String,
    pub output_node_id: Option<String>,
    pub started_at: Timestamp,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The artifact was staged at this path.
    Completed(PathBuf),
    Cancelled,
    Failed(BridgeError),
}

/// Result of a single [`PollTask::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Check again on the next tick.
    Pending,
    Finished(RunOutcome),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Starts generation runs and holds their shared state.
pub struct JobController {
    api: Arc<dyn JobApi>,
    config: BridgeConfig,
    state: Arc<RwLock<ControllerState>>,
    event_tx: broadcast::Sender<BridgeEvent>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
}

impl JobController {
    pub fn new(api: Arc<dyn JobApi>, config: BridgeConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            config,
            state: Arc::new(RwLock::new(ControllerState::default())),
            event_tx,
            notifier: None,
        }
    }

    /// Controller talking HTTP to `config.api_url`.
    pub fn from_config(config: BridgeConfig) -> Self {
        let api = Arc::new(ComfyUIApi::new(config.api_url.clone()));
        Self::new(api, config)
    }

    /// Notify on completion. Ignored when `notify_on_finish` is off.
    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Subscribe to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    pub async fn is_generating(&self) -> bool {
        self.state.read().await.is_generating()
    }

    /// Path of the most recently staged artifact not yet imported or
    /// discarded.
    pub async fn latest_artifact(&self) -> Option<PathBuf> {
        self.state.read().await.latest_artifact.clone()
    }

    /// Forget the latest artifact without importing it. The file stays on
    /// disk.
    pub async fn discard_artifact(&self) -> Option<PathBuf> {
        self.state.write().await.latest_artifact.take()
    }

    /// Import the latest artifact through `importer` and forget it.
    pub async fn import_latest(
        &self,
        importer: &dyn ArtifactImporter,
    ) -> Result<PathBuf, BridgeError> {
        let path = self.latest_artifact().await.ok_or_else(|| {
            BridgeError::ArtifactNotFound("no generated artifact to import".to_string())
        })?;
        if !path.is_file() {
            return Err(BridgeError::ArtifactNotFound(format!(
                "{} no longer exists",
                path.display()
            )));
        }

        let kind = ArtifactKind::from_path(&path);
        importer.import(&path, kind)?;
        tracing::info!(path = %path.display(), ?kind, "Artifact imported");

        let mut state = self.state.write().await;
        if state.latest_artifact.as_deref() == Some(path.as_path()) {
            state.latest_artifact = None;
        }
        Ok(path)
    }

    /// Stop the active run. Returns `false` when nothing was running.
    ///
    /// The generating flag drops immediately; the poll task notices on its
    /// next tick and makes no further requests.
    pub async fn cancel(&self) -> bool {
        match self.state.write().await.active.take() {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!(run_id = %run.id, "Generation cancelled");
                true
            }
            None => false,
        }
    }

    /// Prepare and submit a run.
    ///
    /// Captures the view unless an image override points at a local file,
    /// uploads images, merges overrides into a copy of the template and
    /// submits it. On any failure the generating flag is reset.
    pub async fn start(
        &self,
        request: GenerationRequest<'_>,
        capture: &dyn ViewCapture,
    ) -> Result<PollTask, BridgeError> {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write().await;
            if state.is_generating() {
                return Err(BridgeError::AlreadyRunning);
            }
            state.active = Some(ActiveRun {
                id: run_id,
                cancel: cancel.clone(),
            });
        }
        let mut guard = RunGuard {
            state: &self.state,
            run_id,
            armed: true,
        };

        let started_at = Utc::now();
        match self.submit(&request, capture).await {
            Ok((prompt_id, client_id)) => {
                guard.armed = false;
                let _ = self.event_tx.send(BridgeEvent::Submitted {
                    prompt_id: prompt_id.clone(),
                });
                let run = JobRun {
                    run_id,
                    prompt_id,
                    client_id,
                    output_node_id: request.output_node_id.map(str::to_string),
                    started_at,
                };
                Ok(self.poll_task(run, cancel))
            }
            Err(e) => {
                guard.armed = false;
                self.state.write().await.release(run_id);
                tracing::error!(error = %e, "Generation failed before submission");
                let _ = self.event_tx.send(BridgeEvent::Failed {
                    prompt_id: None,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// [`start`](Self::start) and spawn the poll loop.
    pub async fn generate(
        &self,
        request: GenerationRequest<'_>,
        capture: &dyn ViewCapture,
    ) -> Result<RunHandle, BridgeError> {
        Ok(self.start(request, capture).await?.spawn())
    }

    async fn submit(
        &self,
        request: &GenerationRequest<'_>,
        capture: &dyn ViewCapture,
    ) -> Result<(String, String), BridgeError> {
        if !self.api.probe().await {
            return Err(BridgeError::ConnectionFailure(self.config.api_url.clone()));
        }

        let mut template = request.template.clone();
        let mut overrides = request.overrides.to_vec();

        if has_any_local_image_override(&overrides) {
            tracing::info!("Local image override set, skipping view capture");
        } else {
            let captured = capture.capture_view()?;
            if !captured.is_file() {
                return Err(BridgeError::Capture(format!(
                    "render did not produce {}",
                    captured.display()
                )));
            }
            let asset = self
                .api
                .upload_asset(&captured, "", UPLOAD_KIND_INPUT)
                .await
                .map_err(upload_error)?;
            match request.input_node_id {
                Some(node_id) if inject_uploaded_image(&mut template, node_id, &asset) => {}
                Some(node_id) => {
                    tracing::warn!(node_id, "Input node not in template, capture not injected");
                }
                None => tracing::warn!("No input node selected, capture not injected"),
            }
        }

        for o in overrides.iter_mut() {
            let OverrideValue::ImagePath { local, remote_name } = &mut o.value else {
                continue;
            };
            if !local.is_file() {
                continue;
            }
            let asset = self
                .api
                .upload_asset(local, "", UPLOAD_KIND_INPUT)
                .await
                .map_err(upload_error)?;
            *remote_name = Some(asset.name);
        }

        let merged = merge(&template, &overrides);
        let client_id = Uuid::new_v4().to_string();
        let prompt_id = self
            .api
            .submit(&merged.to_value(), &client_id)
            .await
            .map_err(|e| submit_error(e, &self.config.api_url))?;
        Ok((prompt_id, client_id))
    }

    fn poll_task(&self, run: JobRun, cancel: CancellationToken) -> PollTask {
        let mut resolver = ResultResolver::new(
            self.config.comfyui_output_dir.clone(),
            self.config.output_dir.clone(),
            run.started_at,
        );
        resolver.begin_polling();
        let notifier = if self.config.notify_on_finish {
            self.notifier.clone()
        } else {
            None
        };
        PollTask {
            api: Arc::clone(&self.api),
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
            notifier,
            job: run,
            resolver,
            phase: Phase::Polling,
            attempts: 0,
            max_attempts: self.config.max_poll_attempts,
            poll_interval: self.config.poll_interval,
            cancel,
            outcome: None,
        }
    }
}

/// Clears the active run if `start` is dropped before it returns.
struct RunGuard<'a> {
    state: &'a Arc<RwLock<ControllerState>>,
    run_id: Uuid,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(run_id = %self.run_id, "Start abandoned before submission");
            release_detached(self.state, self.run_id);
        }
    }
}

/// Release `run_id` from a synchronous context.
///
/// Takes the lock directly when it is free, otherwise hands the release
/// to the current Tokio runtime.
fn release_detached(state: &Arc<RwLock<ControllerState>>, run_id: Uuid) {
    if let Ok(mut guard) = state.try_write() {
        guard.release(run_id);
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let state = Arc::clone(state);
            handle.spawn(async move {
                state.write().await.release(run_id);
            });
        }
        Err(_) => tracing::warn!(%run_id, "No runtime to release abandoned run"),
    }
}

fn upload_error(err: ComfyUIApiError) -> BridgeError {
    match err {
        ComfyUIApiError::AssetNotFound(path) => BridgeError::AssetNotFound(path),
        other => BridgeError::UploadError(other.to_string()),
    }
}

fn submit_error(err: ComfyUIApiError, api_url: &str) -> BridgeError {
    match err {
        ComfyUIApiError::Request(_) => BridgeError::ConnectionFailure(api_url.to_string()),
        ComfyUIApiError::SubmitRejected(body) => BridgeError::SubmitRejected(body),
        ComfyUIApiError::ApiError { status, body } => {
            BridgeError::SubmitRejected(format!("HTTP {status}: {body}"))
        }
        other => BridgeError::SubmitRejected(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Poll task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Phase {
    Polling,
    Downloading(OutputFile),
}

/// Per-run polling state machine.
///
/// Each tick makes at most one network request: a history query, or the
/// download of an artifact located on the previous tick.
pub struct PollTask {
    api: Arc<dyn JobApi>,
    state: Arc<RwLock<ControllerState>>,
    event_tx: broadcast::Sender<BridgeEvent>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    job: JobRun,
    resolver: ResultResolver,
    phase: Phase,
    attempts: u32,
    max_attempts: u32,
    poll_interval: Duration,
    cancel: CancellationToken,
    outcome: Option<RunOutcome>,
}

impl std::fmt::Debug for PollTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollTask")
            .field("job", &self.job)
            .field("phase", &self.phase)
            .field("resolver_state", &self.resolver.state())
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// An unfinished task that goes away stops its run.
impl Drop for PollTask {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.cancel.cancel();
            release_detached(&self.state, self.job.run_id);
        }
    }
}

impl PollTask {
    pub fn job(&self) -> &JobRun {
        &self.job
    }

    pub fn resolver_state(&self) -> ResolverState {
        self.resolver.state()
    }

    /// Network requests made so far by this task.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Token that stops this task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advance the run by one step.
    ///
    /// Cancellation is checked first, against the state as it is when the
    /// tick begins. A cancelled run makes no further requests. Ticking a
    /// finished task returns its outcome again.
    pub async fn tick(&mut self) -> TickOutcome {
        if let Some(outcome) = &self.outcome {
            return TickOutcome::Finished(outcome.clone());
        }

        let live = !self.cancel.is_cancelled() && self.state.read().await.is_active(self.job.run_id);
        if !live {
            return self.cancelled().await;
        }

        if self.attempts >= self.max_attempts {
            return self
                .fail(BridgeError::Timeout {
                    prompt_id: self.job.prompt_id.clone(),
                    attempts: self.attempts,
                })
                .await;
        }
        self.attempts += 1;

        match std::mem::replace(&mut self.phase, Phase::Polling) {
            Phase::Polling => self.poll_history().await,
            Phase::Downloading(file) => self.download(file).await,
        }
    }

    /// Tick every `poll_interval` until the run finishes.
    ///
    /// The first check happens one interval after the call. Cancelling the
    /// token wakes the loop early.
    pub async fn run(mut self) -> RunOutcome {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let cancel = self.cancel.clone();
        tracing::debug!(
            prompt_id = %self.job.prompt_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Polling started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ticker.tick() => {}
            }
            if let TickOutcome::Finished(outcome) = self.tick().await {
                return outcome;
            }
        }
    }

    /// Run on the Tokio runtime in the background.
    pub fn spawn(self) -> RunHandle {
        let cancel = self.cancel_token();
        let prompt_id = self.job.prompt_id.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(self.run().await);
        });
        RunHandle {
            prompt_id,
            cancel,
            outcome: rx,
        }
    }

    async fn poll_history(&mut self) -> TickOutcome {
        let prompt_id = self.job.prompt_id.clone();
        let _ = self.event_tx.send(BridgeEvent::Polled {
            prompt_id: prompt_id.clone(),
            attempt: self.attempts,
        });

        let entry = match self.api.query_status(&prompt_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::debug!(prompt_id = %prompt_id, attempt = self.attempts, "Job still running");
                return TickOutcome::Pending;
            }
            Err(e) => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    attempt = self.attempts,
                    error = %e,
                    "Status check failed, retrying next tick",
                );
                return TickOutcome::Pending;
            }
        };

        if entry.is_error() {
            return self.fail(BridgeError::ExecutionFailed(prompt_id)).await;
        }

        let output_node_id = self.job.output_node_id.clone();
        match self.resolver.locate(&entry, output_node_id.as_deref()) {
            Ok(Located::Metadata {
                file,
                local: Some(path),
            }) => {
                let staged = self.resolver.stage_copy(ArtifactSource::Remote(file), &path);
                self.settle(staged).await
            }
            Ok(Located::Metadata { file, local: None }) => {
                tracing::debug!(filename = %file.filename, "Artifact will be downloaded next tick");
                self.phase = Phase::Downloading(file);
                TickOutcome::Pending
            }
            Ok(Located::Scanned(path)) => {
                let staged = self
                    .resolver
                    .stage_copy(ArtifactSource::Local(path.clone()), &path);
                self.settle(staged).await
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn download(&mut self, file: OutputFile) -> TickOutcome {
        match self
            .api
            .download_artifact(&file.filename, &file.subfolder, &file.kind)
            .await
        {
            Ok(bytes) => {
                let staged = self.resolver.stage_download(file, &bytes);
                self.settle(staged).await
            }
            Err(e) if e.is_connection() => {
                tracing::warn!(
                    filename = %file.filename,
                    error = %e,
                    "Download failed, retrying next tick",
                );
                self.phase = Phase::Downloading(file);
                TickOutcome::Pending
            }
            Err(e) => {
                self.fail(BridgeError::ArtifactNotFound(format!(
                    "download of {} failed: {e}",
                    file.filename
                )))
                .await
            }
        }
    }

    async fn settle(&mut self, staged: Result<ResolvedArtifact, BridgeError>) -> TickOutcome {
        match staged {
            Ok(artifact) => self.complete(artifact).await,
            Err(e) => self.fail(e).await,
        }
    }

    async fn complete(&mut self, artifact: ResolvedArtifact) -> TickOutcome {
        let path = artifact.destination;
        {
            let mut state = self.state.write().await;
            state.latest_artifact = Some(path.clone());
            state.release(self.job.run_id);
        }
        tracing::info!(
            prompt_id = %self.job.prompt_id,
            path = %path.display(),
            source = ?artifact.source,
            "Generation completed",
        );
        if let Some(notifier) = &self.notifier {
            notifier.notify(&path);
        }
        let _ = self.event_tx.send(BridgeEvent::Completed {
            prompt_id: self.job.prompt_id.clone(),
            artifact: path.clone(),
        });
        self.conclude(RunOutcome::Completed(path))
    }

    async fn fail(&mut self, error: BridgeError) -> TickOutcome {
        self.resolver.fail();
        self.state.write().await.release(self.job.run_id);
        tracing::error!(prompt_id = %self.job.prompt_id, error = %error, "Generation failed");
        let _ = self.event_tx.send(BridgeEvent::Failed {
            prompt_id: Some(self.job.prompt_id.clone()),
            error: error.to_string(),
        });
        self.conclude(RunOutcome::Failed(error))
    }

    async fn cancelled(&mut self) -> TickOutcome {
        self.state.write().await.release(self.job.run_id);
        tracing::info!(prompt_id = %self.job.prompt_id, "Polling stopped");
        let _ = self.event_tx.send(BridgeEvent::Cancelled {
            prompt_id: self.job.prompt_id.clone(),
        });
        self.conclude(RunOutcome::Cancelled)
    }

    fn conclude(&mut self, outcome: RunOutcome) -> TickOutcome {
        self.outcome = Some(outcome.clone());
        TickOutcome::Finished(outcome)
    }
}

/// Handle to a spawned poll task.
#[derive(Debug)]
pub struct RunHandle {
    prompt_id: String,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Stop polling. Prefer [`JobController::cancel`], which also drops
    /// the generating flag right away.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    pub async fn outcome(self) -> RunOutcome {
        self.outcome.await.unwrap_or(RunOutcome::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_only_clears_matching_run() {
        let first = Uuid::new_v4();
        let mut state = ControllerState {
            active: Some(ActiveRun {
                id: first,
                cancel: CancellationToken::new(),
            }),
            latest_artifact: None,
        };
        state.release(Uuid::new_v4());
        assert!(state.is_generating());
        state.release(first);
        assert!(!state.is_generating());
    }

    #[test]
    fn submit_errors_map_to_bridge_errors() {
        assert_eq!(
            submit_error(ComfyUIApiError::SubmitRejected("{}".into()), "http://x"),
            BridgeError::SubmitRejected("{}".into())
        );
        assert_eq!(
            submit_error(
                ComfyUIApiError::ApiError {
                    status: 400,
                    body: "bad".into()
                },
                "http://x"
            ),
            BridgeError::SubmitRejected("HTTP 400: bad".into())
        );
    }

    #[test]
    fn upload_errors_keep_missing_path() {
        let path = PathBuf::from("/tmp/missing.png");
        assert_eq!(
            upload_error(ComfyUIApiError::AssetNotFound(path.clone())),
            BridgeError::AssetNotFound(path)
        );
        assert!(matches!(
            upload_error(ComfyUIApiError::InvalidResponse("x".into())),
            BridgeError::UploadError(_)
        ));
    }
}
