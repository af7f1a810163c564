//! Control channel and persistence collaborators for the workbench.
//!
//! [`control::ControlServer`] speaks the websocket protocol the UI
//! drives; [`projects::ProjectStore`] persists saved projects as JSON
//! files.

pub mod control;
pub mod projects;

pub use control::ControlServer;
pub use projects::{Project, ProjectStore, ProjectSummary};
