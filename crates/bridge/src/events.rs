//! Run lifecycle events.
//!
//! Broadcast by the controller so a host UI can refresh its status line
//! without polling the controller state.

use std::path::PathBuf;

use serde::Serialize;

/// A state change of the current generation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BridgeEvent {
    /// The workflow was accepted by ComfyUI.
    Submitted { prompt_id: String },

    /// A status check was sent.
    Polled { prompt_id: String, attempt: u32 },

    /// The artifact was staged locally.
    Completed { prompt_id: String, artifact: PathBuf },

    /// The run stopped with an error. `prompt_id` is `None` when the run
    /// failed before submission.
    Failed {
        prompt_id: Option<String>,
        /// Human-readable error description.
        error: String,
    },

    /// The run was cancelled by the user.
    Cancelled { prompt_id: String },
}
