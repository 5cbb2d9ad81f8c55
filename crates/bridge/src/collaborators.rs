//! Host-side capabilities the bridge calls into.
//!
//! The host application owns rendering, scene import and user
//! notification. The controller only sees these traits.

use std::path::{Path, PathBuf};

use crate::error::BridgeError;

/// Renders the current viewport to an image file.
pub trait ViewCapture: Send + Sync {
    /// Render and return the path of the written image.
    fn capture_view(&self) -> Result<PathBuf, BridgeError>;
}

/// Brings a finished artifact into the host scene.
pub trait ArtifactImporter: Send + Sync {
    fn import(&self, path: &Path, kind: ArtifactKind) -> Result<(), BridgeError>;
}

/// Tells the user a run finished.
pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, artifact: &Path);
}

/// How the host should import an artifact, by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Loaded as an image/texture.
    Image,
    /// glTF scene (`.glb` / `.gltf`).
    Gltf,
    /// Wavefront OBJ mesh.
    Obj,
    Unknown,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("png" | "jpg" | "jpeg" | "tga" | "exr") => Self::Image,
            Some("glb" | "gltf") => Self::Gltf,
            Some("obj") => Self::Obj,
            _ => Self::Unknown,
        }
    }
}
