use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A file stored on the ComfyUI server, as returned by `/upload/image`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    /// Server-side filename (may differ from the uploaded name on collision).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder type, usually `input`.
    #[serde(rename = "type", default = "default_asset_kind")]
    pub kind: String,
}

fn default_asset_kind() -> String {
    "input".to_string()
}
