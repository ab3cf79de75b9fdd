//! Docker Adapter
//!
//! Implementation of RuntimeAdapter for Docker using the bollard library.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogOutput, UploadToContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use bytes::Bytes;
use futures_util::{FutureExt, Stream, StreamExt};
use std::collections::HashMap;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::runtime::adapter::{ContainerInfo, ExecSession, ExecSpec, RuntimeAdapter};

/// Buffer size of the in-process pipes carrying demultiplexed exec output
const EXEC_PIPE_CAPACITY: usize = 64 * 1024;

/// Docker runtime adapter
pub struct DockerAdapter {
    client: Docker,
    socket_path: Option<String>,
}

impl DockerAdapter {
    /// Create a new Docker adapter from the local environment (`DOCKER_HOST`
    /// or the platform default socket)
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker")?;

        Ok(Self {
            client,
            socket_path: None,
        })
    }

    /// Create a new Docker adapter with a custom socket path
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker socket")?;

        Ok(Self {
            client,
            socket_path: Some(socket_path.to_string()),
        })
    }

    /// Connect using an optional socket override
    pub fn connect(socket_path: Option<&str>) -> Result<Self> {
        match socket_path {
            Some(path) => Self::with_socket(path),
            None => Self::new(),
        }
    }

    /// Socket the client was explicitly pointed at, if any
    pub fn socket_path(&self) -> Option<&str> {
        self.socket_path.as_deref()
    }

    fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), vec![label.to_string()])])
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn runtime_type(&self) -> &str {
        "docker"
    }

    async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: Self::label_filter(label),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .context("Error listing containers")?;

        Ok(containers
            .into_iter()
            .map(|container| ContainerInfo {
                id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                labels: container.labels.unwrap_or_default(),
            })
            .filter(|info| !info.id.is_empty())
            .collect())
    }

    async fn inspect_env(&self, id: &str) -> Result<Vec<String>> {
        let container = self
            .client
            .inspect_container(id, None)
            .await
            .with_context(|| format!("Failed inspecting container {}", id))?;

        Ok(container
            .config
            .and_then(|c| c.env)
            .unwrap_or_default())
    }

    async fn upload_archive(&self, id: &str, dir: &str, archive: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await
            .with_context(|| format!("Failed uploading archive to {}", dir))?;
        debug!(container_id = %id, dir = %dir, "Archive uploaded");
        Ok(())
    }

    async fn exec_attached(&self, id: &str, spec: ExecSpec) -> Result<ExecSession> {
        let exec_options = CreateExecOptions {
            cmd: Some(spec.cmd),
            env: Some(spec.env),
            user: Some(spec.user),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, exec_options)
            .await
            .context("Failed creating exec")?;

        let (output, input) = match self
            .client
            .start_exec(&exec.id, None)
            .await
            .context("Failed starting exec")?
        {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(anyhow::anyhow!("Exec {} started detached", exec.id));
            }
        };

        let (stdout_tx, stdout_rx) = tokio::io::duplex(EXEC_PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(EXEC_PIPE_CAPACITY);
        let demux = AbortOnDrop(tokio::spawn(demux_output(output, stdout_tx, stderr_tx)));

        let client = self.client.clone();
        let exec_id = exec.id;
        let exit = async move {
            let mut demux = demux;
            let _ = (&mut demux.0).await;
            let inspect = client
                .inspect_exec(&exec_id)
                .await
                .context("Failed inspecting exec")?;
            Ok::<_, anyhow::Error>(inspect.exit_code)
        }
        .boxed();

        Ok(ExecSession {
            stdin: input,
            stdout: Box::pin(stdout_rx),
            stderr: Box::pin(stderr_rx),
            exit,
        })
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Split the multiplexed attach stream into separate stdout and stderr pipes.
///
/// Ends when the attach stream ends or both pipe readers are gone. Dropping
/// the writers signals EOF to the readers.
async fn demux_output<S>(mut output: S, mut stdout: DuplexStream, mut stderr: DuplexStream)
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout_open = true;
    let mut stderr_open = true;

    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                if stdout_open && stdout.write_all(&message).await.is_err() {
                    stdout_open = false;
                }
            }
            Ok(LogOutput::StdErr { message }) => {
                if stderr_open && stderr.write_all(&message).await.is_err() {
                    stderr_open = false;
                }
            }
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                debug!(error = %e, "Exec attach stream failed");
                break;
            }
        }

        if !stdout_open && !stderr_open {
            break;
        }
    }
}
