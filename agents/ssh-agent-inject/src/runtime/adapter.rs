//! Runtime Adapter Trait
//!
//! Defines the slice of a container runtime the injector consumes: listing
//! labelled containers, reading their environment, copying files in, and
//! starting an attached process.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Container information returned by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// Label value, if the label is present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Process to start inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// Numeric user id (or name) the process runs as
    pub user: String,
    /// `KEY=value` entries added to the process environment
    pub env: Vec<String>,
}

/// Writable half handed to the relay
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Readable stream handed to the relay
pub type ExecOutput = Pin<Box<dyn AsyncRead + Send>>;

/// A started process with its three standard streams attached.
///
/// `exit` resolves once the process has exited (or its attach stream ended)
/// and yields the exit code when the runtime reports one. Dropping `exit`
/// before it resolves detaches from the process.
pub struct ExecSession {
    pub stdin: ExecInput,
    pub stdout: ExecOutput,
    pub stderr: ExecOutput,
    pub exit: BoxFuture<'static, Result<Option<i64>>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").finish_non_exhaustive()
    }
}

/// Runtime adapter trait - common interface for container runtimes
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Get the runtime type name
    fn runtime_type(&self) -> &str;

    /// Get runtime version information
    async fn version(&self) -> Result<String>;

    /// List running containers carrying the given label key
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerInfo>>;

    /// Read the configured environment (`KEY=value` entries) of a container
    async fn inspect_env(&self, id: &str) -> Result<Vec<String>>;

    /// Extract a tar archive into `dir` inside the container, overwriting
    /// existing files
    async fn upload_archive(&self, id: &str, dir: &str, archive: Bytes) -> Result<()>;

    /// Start a process in a running container with stdin, stdout and stderr
    /// attached
    async fn exec_attached(&self, id: &str, spec: ExecSpec) -> Result<ExecSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lookup() {
        let info = ContainerInfo {
            id: "abc".to_string(),
            name: "web".to_string(),
            labels: HashMap::from([("inject-ssh-uid".to_string(), "1000".to_string())]),
        };
        assert_eq!(info.label("inject-ssh-uid"), Some("1000"));
        assert_eq!(info.label("inject-ssh-agent"), None);
    }
}
