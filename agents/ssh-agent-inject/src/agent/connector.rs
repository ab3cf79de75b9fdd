//! Host ssh-agent connector
//!
//! Opens a duplex byte stream to the operator's local ssh-agent. On Unix this
//! is the domain socket named by `SSH_AUTH_SOCK`; on Windows it is the OpenSSH
//! agent named pipe.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

/// Environment variable naming the host agent socket
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Named pipe served by the Windows OpenSSH agent
#[cfg(windows)]
pub const WINDOWS_AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Duplex stream to the host agent
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentStream for T {}

/// Opens connections to the host ssh-agent
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn AgentStream>>;
}

/// Connects to the agent endpoint on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct SocketAgentConnector {
    path: Option<PathBuf>,
}

impl SocketAgentConnector {
    /// Connector for an explicit endpoint, or the platform default when `None`
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Endpoint the next connection will use.
    ///
    /// The environment is read on every call so a restarted agent with a new
    /// socket is picked up without restarting the injector.
    pub fn resolve(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }

        #[cfg(windows)]
        {
            Ok(PathBuf::from(WINDOWS_AGENT_PIPE))
        }

        #[cfg(not(windows))]
        {
            std::env::var_os(AUTH_SOCK_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .with_context(|| format!("{} is not set", AUTH_SOCK_ENV))
        }
    }
}

#[async_trait]
impl AgentConnector for SocketAgentConnector {
    #[cfg(unix)]
    async fn connect(&self) -> Result<Box<dyn AgentStream>> {
        let path = self.resolve()?;
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    async fn connect(&self) -> Result<Box<dyn AgentStream>> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let path = self.resolve()?;
        let pipe = ClientOptions::new()
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(pipe))
    }
}
