//! Generation bridge between a 3D host application and ComfyUI.
//!
//! Ties the template model and the ComfyUI client together: a
//! [`controller::JobController`] uploads inputs, submits the merged
//! workflow and hands back a [`controller::PollTask`] that the host
//! drives on a timer. When the job finishes, the
//! [`resolver::ResultResolver`] finds the produced file and stages it
//! into the configured output directory.

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod resolver;
pub mod telemetry;
