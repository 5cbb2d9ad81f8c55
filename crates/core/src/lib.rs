//! Workflow template model and parameter overrides for the Retexturity
//! bridge.
//!
//! Parses ComfyUI API-format workflows into typed nodes, discovers the
//! scalar inputs a user may edit, and merges overrides back into a
//! fresh copy of the graph before submission.

pub mod error;
pub mod parameters;
pub mod template;
pub mod types;
