//! Injection Errors
//!
//! Failure taxonomy for the injection pipeline. None of these are fatal to the
//! process; the coordinator logs them and abandons the affected attempt.

use std::path::PathBuf;

/// Errors raised while discovering, deploying to, or relaying for a container
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// Listing containers from the runtime failed
    #[error("failed listing containers: {0:#}")]
    Directory(#[source] anyhow::Error),

    /// Inspecting a single container failed
    #[error("failed inspecting container: {0:#}")]
    Inspect(#[source] anyhow::Error),

    /// Copying the helper binary into the container failed
    #[error("failed copying payload into container: {0:#}")]
    Deploy(#[source] anyhow::Error),

    /// The host ssh-agent could not be reached
    #[error("failed connecting to host ssh-agent: {0:#}")]
    Connector(#[source] anyhow::Error),

    /// Starting the helper inside the container failed
    #[error("failed starting relay helper: {0:#}")]
    Exec(#[source] anyhow::Error),

    /// The helper binary could not be loaded on the host
    #[error("failed loading payload {}: {source}", path.display())]
    Payload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InjectError {
    /// Short stable name for the failing stage, used as a log field
    pub fn stage(&self) -> &'static str {
        match self {
            InjectError::Directory(_) => "directory",
            InjectError::Inspect(_) => "inspect",
            InjectError::Deploy(_) => "deploy",
            InjectError::Connector(_) => "connector",
            InjectError::Exec(_) => "exec",
            InjectError::Payload { .. } => "payload",
        }
    }
}
