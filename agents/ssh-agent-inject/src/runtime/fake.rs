//! In-memory runtime and agent connector used by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::agent::connector::{AgentConnector, AgentStream};
use crate::runtime::adapter::{ContainerInfo, ExecOutput, ExecSession, ExecSpec, RuntimeAdapter};

const PIPE_CAPACITY: usize = 16 * 1024;

/// Container-side ends of a started exec
pub struct FakeProcess {
    pub container_id: String,
    pub spec: ExecSpec,
    /// Reads what the relay wrote to the process input
    pub stdin: DuplexStream,
    /// Writes what the process emits on its output
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub exit: oneshot::Sender<Option<i64>>,
}

pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerInfo>>,
    envs: Mutex<HashMap<String, Vec<String>>>,
    pub fail_list: AtomicBool,
    pub fail_inspect: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_exec: AtomicBool,
    /// Every read of the process output fails
    pub broken_output: AtomicBool,
    pub list_calls: AtomicUsize,
    uploads: Mutex<Vec<(String, String, Bytes)>>,
    execs: Mutex<Vec<(String, ExecSpec)>>,
    process_tx: mpsc::UnboundedSender<FakeProcess>,
    process_rx: Mutex<Option<mpsc::UnboundedReceiver<FakeProcess>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        Self {
            containers: Mutex::new(Vec::new()),
            envs: Mutex::new(HashMap::new()),
            fail_list: AtomicBool::new(false),
            fail_inspect: AtomicBool::new(false),
            fail_upload: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            broken_output: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            process_tx,
            process_rx: Mutex::new(Some(process_rx)),
        }
    }

    /// Add a running container. Labels are `(key, value)` pairs.
    pub fn add_container(&self, id: &str, labels: &[(&str, &str)], env: &[&str]) {
        self.containers.lock().push(ContainerInfo {
            id: id.to_string(),
            name: format!("{}-name", id),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self.envs
            .lock()
            .insert(id.to_string(), env.iter().map(|e| e.to_string()).collect());
    }

    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.uploads.lock().clone()
    }

    pub fn execs(&self) -> Vec<(String, ExecSpec)> {
        self.execs.lock().clone()
    }

    /// Receiver of processes started through `exec_attached`; can be taken once
    pub fn processes(&self) -> mpsc::UnboundedReceiver<FakeProcess> {
        self.process_rx
            .lock()
            .take()
            .expect("process receiver already taken")
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    fn runtime_type(&self) -> &str {
        "fake"
    }

    async fn version(&self) -> Result<String> {
        Ok("fake 1.0".to_string())
    }

    async fn list_labeled(&self, _label: &str) -> Result<Vec<ContainerInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("daemon unavailable"));
        }
        // Label filtering is left to the caller so eligibility checks are exercised.
        Ok(self.containers.lock().clone())
    }

    async fn inspect_env(&self, id: &str) -> Result<Vec<String>> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(anyhow!("no such container: {}", id));
        }
        Ok(self.envs.lock().get(id).cloned().unwrap_or_default())
    }

    async fn upload_archive(&self, id: &str, dir: &str, archive: Bytes) -> Result<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(anyhow!("container {} is not running", id));
        }
        self.uploads
            .lock()
            .push((id.to_string(), dir.to_string(), archive));
        Ok(())
    }

    async fn exec_attached(&self, id: &str, spec: ExecSpec) -> Result<ExecSession> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(anyhow!("exec refused"));
        }
        self.execs.lock().push((id.to_string(), spec.clone()));

        let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_ours, stdout_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_ours, stderr_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let _ = self.process_tx.send(FakeProcess {
            container_id: id.to_string(),
            spec,
            stdin: stdin_theirs,
            stdout: stdout_theirs,
            stderr: stderr_theirs,
            exit: exit_tx,
        });

        let stdout: ExecOutput = if self.broken_output.load(Ordering::SeqCst) {
            Box::pin(BrokenReader { _inner: stdout_ours })
        } else {
            Box::pin(stdout_ours)
        };

        Ok(ExecSession {
            stdin: Box::pin(stdin_ours),
            stdout,
            stderr: Box::pin(stderr_ours),
            exit: async move { Ok(exit_rx.await.ok().flatten()) }.boxed(),
        })
    }
}

fn connection_reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
}

/// Reader whose every read fails; keeps the pipe open until dropped
pub struct BrokenReader {
    _inner: DuplexStream,
}

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(connection_reset()))
    }
}

/// Agent stream that counts shutdowns and drops of the host connection
pub struct TrackedStream {
    inner: DuplexStream,
    broken_reads: bool,
    shutdowns: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.broken_reads {
            return Poll::Ready(Err(connection_reset()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out in-memory pipes; the far ends go to the test
pub struct FakeConnector {
    pub fail: AtomicBool,
    /// Every read from the host agent fails
    pub broken_reads: AtomicBool,
    pub connects: AtomicUsize,
    pub shutdowns: Arc<AtomicUsize>,
    pub drops: Arc<AtomicUsize>,
    peer_tx: mpsc::UnboundedSender<DuplexStream>,
    peer_rx: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            fail: AtomicBool::new(false),
            broken_reads: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            drops: Arc::new(AtomicUsize::new(0)),
            peer_tx,
            peer_rx: Mutex::new(Some(peer_rx)),
        }
    }

    /// Receiver of the agent-side ends of each connection; can be taken once
    pub fn peers(&self) -> mpsc::UnboundedReceiver<DuplexStream> {
        self.peer_rx.lock().take().expect("peer receiver already taken")
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn AgentStream>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("agent socket missing"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let _ = self.peer_tx.send(theirs);
        Ok(Box::new(TrackedStream {
            inner: ours,
            broken_reads: self.broken_reads.load(Ordering::SeqCst),
            shutdowns: self.shutdowns.clone(),
            drops: self.drops.clone(),
        }))
    }
}
