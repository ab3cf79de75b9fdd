//! Relay Engine
//!
//! Runs the helper inside a container and pumps bytes between it and the host
//! ssh-agent until either side closes.
//!
//! A session consists of three concurrent tasks:
//!
//! - host agent -> helper stdin
//! - helper stdout -> host agent
//! - helper stderr -> log lines
//!
//! Whichever task finishes first fires the session [`Teardown`], which makes
//! the other two stop as well. Each handle has exactly one owning task, which
//! shuts it down and drops it when that task ends, so every handle is closed
//! once no matter which side went away first.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::connector::{AgentConnector, AUTH_SOCK_ENV};
use crate::error::InjectError;
use crate::runtime::adapter::{ExecSession, ExecSpec, RuntimeAdapter};

/// Flag passed to the helper when verbose output is requested
const HELPER_VERBOSE_FLAG: &str = "-v";

/// Where a relay session should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionTarget {
    pub container_id: String,
    /// User the helper runs as inside the container
    pub user: String,
    /// Agent socket path the helper serves inside the container
    pub socket_path: String,
}

/// Static settings shared by all relay sessions
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Absolute path of the deployed helper inside containers
    pub helper_path: String,
    /// Environment variable carrying the in-container socket path
    pub socket_env: String,
    /// Start the helper with its verbose flag
    pub verbose: bool,
    /// How long to wait for the helper to exit once all streams are closed
    /// (unset = until it exits)
    pub exit_grace: Option<Duration>,
    /// Tear the session down after this long, if set
    pub session_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            helper_path: "/usr/local/bin/ssh-agent-pipe".to_string(),
            socket_env: AUTH_SOCK_ENV.to_string(),
            verbose: false,
            exit_grace: None,
            session_timeout: None,
        }
    }
}

/// One leg of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host agent to helper stdin
    ToContainer,
    /// Helper stdout to host agent
    ToAgent,
    /// Helper stderr to the log
    Diagnostics,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToContainer => "agent->container",
            Direction::ToAgent => "container->agent",
            Direction::Diagnostics => "container-stderr",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// A relay task finished (EOF or error)
    Closed(Direction),
    /// The optional session timeout elapsed
    Timeout,
}

impl std::fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownCause::Closed(direction) => write!(f, "{} closed", direction),
            TeardownCause::Timeout => f.write_str("session timeout"),
        }
    }
}

/// Session-wide close signal, fired once by whichever trigger comes first
pub struct Teardown {
    container_id: String,
    cause: Mutex<Option<TeardownCause>>,
    signal: watch::Sender<bool>,
}

impl Teardown {
    fn new(container_id: &str) -> Arc<Self> {
        let (signal, _) = watch::channel(false);
        Arc::new(Self {
            container_id: container_id.to_string(),
            cause: Mutex::new(None),
            signal,
        })
    }

    /// Fire the teardown. Returns `true` only for the call that fired it.
    pub fn fire(&self, cause: TeardownCause) -> bool {
        {
            let mut current = self.cause.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
        }

        debug!(container_id = %self.container_id, cause = %cause, "Tearing down relay session");
        self.signal.send_replace(true);
        true
    }

    /// Record that one task has finished; fires the teardown if it has not
    /// fired yet
    fn complete(&self, direction: Direction) {
        self.fire(TeardownCause::Closed(direction));
    }

    /// What fired the teardown, if it has fired
    pub fn cause(&self) -> Option<TeardownCause> {
        *self.cause.lock()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

/// Resolves once the teardown has fired
async fn fired(signal: &mut watch::Receiver<bool>) {
    loop {
        let fired = *signal.borrow_and_update();
        if fired || signal.changed().await.is_err() {
            return;
        }
    }
}

/// Summary of a finished relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub container_id: String,
    /// What ended the session
    pub cause: Option<TeardownCause>,
    /// Helper exit code, when the runtime reported one
    pub exit_code: Option<i64>,
    /// Whether the helper was seen to exit
    pub exited: bool,
    pub duration: Duration,
}

/// Launches the helper in a container and relays the host agent through it
pub struct RelayEngine<R: RuntimeAdapter, C: AgentConnector> {
    runtime: Arc<R>,
    connector: Arc<C>,
    settings: RelaySettings,
}

impl<R: RuntimeAdapter, C: AgentConnector> RelayEngine<R, C> {
    /// Create a new relay engine
    pub fn new(runtime: Arc<R>, connector: Arc<C>, settings: RelaySettings) -> Self {
        Self {
            runtime,
            connector,
            settings,
        }
    }

    /// Process specification for the helper of a target
    pub fn exec_spec(&self, target: &InjectionTarget) -> ExecSpec {
        let mut cmd = vec![self.settings.helper_path.clone()];
        if self.settings.verbose {
            cmd.push(HELPER_VERBOSE_FLAG.to_string());
        }

        ExecSpec {
            cmd,
            user: target.user.clone(),
            env: vec![format!("{}={}", self.settings.socket_env, target.socket_path)],
        }
    }

    /// Run one relay session to completion.
    ///
    /// The host agent is connected before anything is started in the
    /// container, so a missing agent never leaves an orphaned helper behind.
    pub async fn run(&self, target: &InjectionTarget) -> Result<SessionReport, InjectError> {
        let container_id = target.container_id.as_str();
        let started = Instant::now();

        let conn = self
            .connector
            .connect()
            .await
            .map_err(InjectError::Connector)?;
        debug!(container_id = %container_id, "Connected to host ssh-agent");

        let session = self
            .runtime
            .exec_attached(container_id, self.exec_spec(target))
            .await
            .map_err(InjectError::Exec)?;
        debug!(
            container_id = %container_id,
            user = %target.user,
            socket_path = %target.socket_path,
            "Injecting ssh-agent"
        );

        let ExecSession {
            stdin,
            stdout,
            stderr,
            exit,
        } = session;
        let (agent_rx, agent_tx) = tokio::io::split(conn);
        let teardown = Teardown::new(container_id);

        let tasks = [
            tokio::spawn(pump(agent_rx, stdin, Direction::ToContainer, teardown.clone())),
            tokio::spawn(pump(stdout, agent_tx, Direction::ToAgent, teardown.clone())),
            tokio::spawn(log_lines(stderr, teardown.clone())),
        ];

        let watchdog = self.settings.session_timeout.map(|timeout| {
            let teardown = teardown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if teardown.fire(TeardownCause::Timeout) {
                    warn!(
                        container_id = %teardown.container_id,
                        timeout_secs = timeout.as_secs(),
                        "Relay session timed out"
                    );
                }
            })
        });

        for task in tasks {
            if let Err(e) = task.await {
                warn!(container_id = %container_id, error = %e, "Relay task aborted");
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let waited = match self.settings.exit_grace {
            Some(grace) => tokio::time::timeout(grace, exit).await.ok(),
            None => Some(exit.await),
        };
        let (exited, exit_code) = match waited {
            Some(Ok(code)) => (true, code),
            Some(Err(e)) => {
                debug!(container_id = %container_id, error = %e, "Failed waiting for relay helper");
                (true, None)
            }
            None => {
                warn!(
                    container_id = %container_id,
                    grace_ms = self.settings.exit_grace.unwrap_or_default().as_millis() as u64,
                    "Relay helper still running after streams closed, detaching"
                );
                (false, None)
            }
        };

        match exit_code {
            Some(code) if code != 0 => {
                debug!(container_id = %container_id, exit_code = code, "Relay helper exited with failure")
            }
            _ => debug!(container_id = %container_id, "Injected ssh-agent terminated"),
        }

        Ok(SessionReport {
            container_id: container_id.to_string(),
            cause: teardown.cause(),
            exit_code,
            exited,
            duration: started.elapsed(),
        })
    }
}

/// Copy one direction until EOF, error, or session teardown, then close
/// both ends owned by this task.
async fn pump<Rd, Wr>(mut reader: Rd, mut writer: Wr, direction: Direction, teardown: Arc<Teardown>)
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut signal = teardown.subscribe();

    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(bytes) => debug!(
                container_id = %teardown.container_id,
                direction = %direction,
                bytes,
                "Relay stream closed"
            ),
            Err(e) => warn!(
                container_id = %teardown.container_id,
                direction = %direction,
                error = %e,
                "Relay copy failed"
            ),
        },
        _ = fired(&mut signal) => {}
    }

    if let Err(e) = writer.shutdown().await {
        debug!(
            container_id = %teardown.container_id,
            direction = %direction,
            error = %e,
            "Failed closing relay stream"
        );
    }
    drop(writer);
    drop(reader);
    teardown.complete(direction);
}

/// Log each stderr line of the helper until EOF or session teardown
async fn log_lines<Rd>(stderr: Rd, teardown: Arc<Teardown>)
where
    Rd: AsyncRead + Unpin,
{
    let mut signal = teardown.subscribe();
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => info!(container_id = %teardown.container_id, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(container_id = %teardown.container_id, error = %e, "Failed reading logs");
                    break;
                }
            },
            _ = fired(&mut signal) => break,
        }
    }

    drop(lines);
    teardown.complete(Direction::Diagnostics);
}
