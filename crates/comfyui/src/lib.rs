//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper used to probe, upload, submit, poll and
//! download from a ComfyUI server, typed history parsing, and the
//! [`job_api::JobApi`] trait the bridge drives.

pub mod api;
pub mod history;
pub mod job_api;
