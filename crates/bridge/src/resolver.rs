//! Finding and staging the artifact a finished job produced.
//!
//! Two discovery channels are tried in order:
//!
//! 1. **Metadata**: the history entry's outputs for the selected output
//!    node. When ComfyUI's output folder is on this machine and the
//!    reported file exists there, it is copied instead of downloaded.
//! 2. **Filesystem**: only when metadata yields nothing. The newest file
//!    with a known artifact extension in ComfyUI's output folder, as long
//!    as it was written after the run started.
//!
//! Staging never overwrites: a name collision gets a Unix-seconds suffix.
//! Files are written under a `.part` name and renamed into place.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use retexturity_comfyui::history::{HistoryEntry, OutputFile};
use retexturity_core::types::Timestamp;

use crate::error::BridgeError;

/// Extensions the filesystem channel considers, lowercase.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["glb", "gltf", "obj", "png", "jpg", "exr"];

/// Slack, in seconds, for clock and filesystem timestamp granularity when
/// checking that a scanned file is newer than the run.
pub const FRESHNESS_TOLERANCE_SECS: i64 = 1;

/// Progress of a run's result resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Submitted,
    Polling,
    Resolved,
    Failed,
}

/// Where a staged artifact came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Reported by ComfyUI in the history outputs.
    Remote(OutputFile),
    /// Found by scanning ComfyUI's output folder.
    Local(PathBuf),
}

/// A located and staged artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub source: ArtifactSource,
    pub destination: PathBuf,
}

/// Result of [`locate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// Found in history metadata. `local` is set when the file is readable
    /// in ComfyUI's output folder.
    Metadata {
        file: OutputFile,
        local: Option<PathBuf>,
    },
    /// Found by the filesystem scan.
    Scanned(PathBuf),
}

/// Tracks one run's resolution and stages its artifact.
#[derive(Debug)]
pub struct ResultResolver {
    comfyui_output_dir: Option<PathBuf>,
    destination_dir: PathBuf,
    started_at: Timestamp,
    state: ResolverState,
}

impl ResultResolver {
    pub fn new(
        comfyui_output_dir: Option<PathBuf>,
        destination_dir: PathBuf,
        started_at: Timestamp,
    ) -> Self {
        Self {
            comfyui_output_dir,
            destination_dir,
            started_at,
            state: ResolverState::Submitted,
        }
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Record that status checks have begun.
    pub fn begin_polling(&mut self) {
        if self.state == ResolverState::Submitted {
            self.state = ResolverState::Polling;
        }
    }

    /// Mark the resolution as failed.
    pub fn fail(&mut self) {
        self.state = ResolverState::Failed;
    }

    /// Locate the artifact for a finished job. Fails the resolver when no
    /// channel finds anything.
    pub fn locate(
        &mut self,
        entry: &HistoryEntry,
        output_node_id: Option<&str>,
    ) -> Result<Located, BridgeError> {
        self.begin_polling();
        let located = locate(
            entry,
            output_node_id,
            self.comfyui_output_dir.as_deref(),
            self.started_at,
        );
        if located.is_err() {
            self.fail();
        }
        located
    }

    /// Copy a local file into the destination folder.
    pub fn stage_copy(
        &mut self,
        source: ArtifactSource,
        path: &Path,
    ) -> Result<ResolvedArtifact, BridgeError> {
        let staged = stage_local(path, &self.destination_dir);
        self.settle(source, staged)
    }

    /// Write downloaded bytes into the destination folder.
    pub fn stage_download(
        &mut self,
        file: OutputFile,
        bytes: &[u8],
    ) -> Result<ResolvedArtifact, BridgeError> {
        let staged = stage_bytes(&file.filename, bytes, &self.destination_dir);
        self.settle(ArtifactSource::Remote(file), staged)
    }

    fn settle(
        &mut self,
        source: ArtifactSource,
        staged: Result<PathBuf, BridgeError>,
    ) -> Result<ResolvedArtifact, BridgeError> {
        match staged {
            Ok(destination) => {
                self.state = ResolverState::Resolved;
                Ok(ResolvedArtifact {
                    source,
                    destination,
                })
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }
}

/// Find the artifact for a finished job.
pub fn locate(
    entry: &HistoryEntry,
    output_node_id: Option<&str>,
    comfyui_output_dir: Option<&Path>,
    started_at: Timestamp,
) -> Result<Located, BridgeError> {
    if let Some(file) = output_node_id.and_then(|id| entry.first_output_file(id)) {
        let local = comfyui_output_dir
            .and_then(|dir| output_path(dir, &file))
            .filter(|path| path.is_file());
        tracing::debug!(
            filename = %file.filename,
            subfolder = %file.subfolder,
            local = ?local,
            "Artifact found in history outputs",
        );
        return Ok(Located::Metadata { file, local });
    }

    if let Some(dir) = comfyui_output_dir {
        if let Some(path) = scan_latest_output(dir, started_at) {
            tracing::info!(path = %path.display(), "Artifact found by output folder scan");
            return Ok(Located::Scanned(path));
        }
    }

    Err(BridgeError::ArtifactNotFound(match output_node_id {
        Some(id) => format!("node {id} reported no output files and no fresh file was found"),
        None => "no output node selected and no fresh file was found".to_string(),
    }))
}

/// Newest artifact file directly inside `dir` modified no earlier than
/// `started_at` minus [`FRESHNESS_TOLERANCE_SECS`].
///
/// Unreadable folders and entries are skipped.
pub fn scan_latest_output(dir: &Path, started_at: Timestamp) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot scan output folder");
            return None;
        }
    };

    let mut newest: Option<(DateTime<Utc>, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !has_artifact_extension(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let modified = DateTime::<Utc>::from(modified);
        if newest.as_ref().map_or(true, |(best, _)| modified > *best) {
            newest = Some((modified, path));
        }
    }

    let (modified, path) = newest?;
    if modified >= started_at - TimeDelta::seconds(FRESHNESS_TOLERANCE_SECS) {
        Some(path)
    } else {
        tracing::debug!(
            path = %path.display(),
            modified = %modified,
            started_at = %started_at,
            "Newest output predates the run",
        );
        None
    }
}

/// Staging path for `filename` inside `dest_dir`.
///
/// Only the final path component of `filename` is used. When the name is
/// taken, `_{unix_seconds}` is inserted before the extension, followed by
/// a counter if that is taken as well.
pub fn destination_for(dest_dir: &Path, filename: &str, now: Timestamp) -> PathBuf {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let candidate = dest_dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = now.timestamp();

    let candidate = dest_dir.join(format!("{stem}_{stamp}{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| dest_dir.join(format!("{stem}_{stamp}_{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Copy `source` into `dest_dir`, returning the staged path.
pub fn stage_local(source: &Path, dest_dir: &Path) -> Result<PathBuf, BridgeError> {
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BridgeError::ArtifactNotFound(source.display().to_string()))?;
    write_staged(dest_dir, &filename, |part| fs::copy(source, part).map(|_| ()))
}

/// Write `bytes` into `dest_dir` as `filename`, returning the staged path.
pub fn stage_bytes(filename: &str, bytes: &[u8], dest_dir: &Path) -> Result<PathBuf, BridgeError> {
    write_staged(dest_dir, filename, |part| fs::write(part, bytes))
}

fn write_staged(
    dest_dir: &Path,
    filename: &str,
    write: impl FnOnce(&Path) -> io::Result<()>,
) -> Result<PathBuf, BridgeError> {
    let stage_error = |path: &Path, e: io::Error| BridgeError::StageWriteError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    fs::create_dir_all(dest_dir).map_err(|e| stage_error(dest_dir, e))?;
    let destination = destination_for(dest_dir, filename, Utc::now());
    let part = part_path(&destination);

    if let Err(e) = write(&part).and_then(|()| fs::rename(&part, &destination)) {
        let _ = fs::remove_file(&part);
        return Err(stage_error(&destination, e));
    }

    tracing::info!(path = %destination.display(), "Artifact staged");
    Ok(destination)
}

fn part_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.part"))
}

/// Path of a reported output inside ComfyUI's output folder.
///
/// `None` when the subfolder or filename would leave the folder (`..`,
/// absolute paths, drive prefixes), or the filename is not a single name.
fn output_path(dir: &Path, file: &OutputFile) -> Option<PathBuf> {
    let subfolder = Path::new(&file.subfolder);
    let filename = Path::new(&file.filename);
    let inside = subfolder
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    let mut name = filename.components();
    let single = matches!(
        (name.next(), name.next()),
        (Some(Component::Normal(_)), None)
    );
    if !inside || !single {
        tracing::warn!(
            filename = %file.filename,
            subfolder = %file.subfolder,
            "Reported output escapes the output folder, not reading it locally",
        );
        return None;
    }
    Some(dir.join(subfolder).join(filename))
}

fn has_artifact_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ARTIFACT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
