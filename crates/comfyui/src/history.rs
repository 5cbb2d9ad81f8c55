//! ComfyUI history types and output lookup.
//!
//! `GET /history/{prompt_id}` answers with `{"<prompt_id>": {...}}` once
//! the prompt has finished, and `{}` before that. The entry's `outputs`
//! maps node IDs to whatever the node reported; output files appear in
//! lists such as `images` or `gifs`, each item carrying `filename`,
//! `subfolder` and `type`.

use serde::{Deserialize, Serialize};

/// Output-list keys inspected on a node's output, in priority order.
pub const OUTPUT_LIST_KEYS: &[&str] = &["images", "gifs", "files", "meshes"];

/// History record of one finished prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Raw outputs keyed by node ID.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Execution status, when the server reports one.
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// A file reported in a node's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder type, usually `output` or `temp`.
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

impl HistoryEntry {
    /// Extract the entry for `prompt_id` from a `/history` response body.
    ///
    /// Returns `Ok(None)` when the prompt is not in history yet.
    pub fn from_history_response(
        body: &serde_json::Value,
        prompt_id: &str,
    ) -> Result<Option<Self>, serde_json::Error> {
        match body.get(prompt_id) {
            Some(entry) => Ok(Some(serde_json::from_value(entry.clone())?)),
            None => Ok(None),
        }
    }

    pub fn status_str(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.status_str.as_deref())
    }

    /// Whether ComfyUI reported the execution as failed.
    pub fn is_error(&self) -> bool {
        self.status_str() == Some("error")
    }

    /// First output file reported by `node_id`.
    ///
    /// Checks [`OUTPUT_LIST_KEYS`] in order and takes the first item of
    /// the first non-empty list. That item must name a file.
    pub fn first_output_file(&self, node_id: &str) -> Option<OutputFile> {
        let node_output = self.outputs.get(node_id)?;
        let first = OUTPUT_LIST_KEYS
            .iter()
            .find_map(|key| node_output.get(*key)?.as_array()?.first())?;
        serde_json::from_value(first.clone()).ok()
    }
}
