//! Injection Coordinator
//!
//! Polls the runtime for opted-in containers and starts one injection per
//! container that is not already being served.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::agent::connector::{AgentConnector, AUTH_SOCK_ENV};
use crate::error::InjectError;
use crate::inject::deploy::PayloadDeployer;
use crate::inject::registry::InjectionRegistry;
use crate::inject::relay::{InjectionTarget, RelayEngine};
use crate::runtime::adapter::{ContainerInfo, RuntimeAdapter};

/// Label marking a container as opted in
pub const INJECTION_LABEL: &str = "inject-ssh-agent";

/// Label selecting the user the helper runs as
pub const USER_LABEL: &str = "inject-ssh-uid";

/// User the helper runs as when no user label is set
pub const DEFAULT_USER: &str = "0";

/// In-container socket path when the container does not override it
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/.ssh-auth-sock";

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub injection_label: String,
    pub user_label: String,
    pub default_user: String,
    pub socket_env: String,
    pub default_socket_path: String,
    /// Delay between successful scans
    pub poll_interval: Duration,
    /// Delay after a failed scan
    pub backoff_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            injection_label: INJECTION_LABEL.to_string(),
            user_label: USER_LABEL.to_string(),
            default_user: DEFAULT_USER.to_string(),
            socket_env: AUTH_SOCK_ENV.to_string(),
            default_socket_path: DEFAULT_SOCKET_PATH.to_string(),
            poll_interval: Duration::from_secs(1),
            backoff_interval: Duration::from_secs(5),
        }
    }
}

/// Check if a container carries the opt-in label
pub fn is_eligible(container: &ContainerInfo, injection_label: &str) -> bool {
    container.label(injection_label).is_some()
}

/// User the helper should run as; an empty label value counts as unset
pub fn target_user<'a>(
    labels: &'a HashMap<String, String>,
    user_label: &str,
    default_user: &'a str,
) -> &'a str {
    labels
        .get(user_label)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .unwrap_or(default_user)
}

/// In-container socket path from `KEY=value` environment entries; an empty
/// value counts as unset
pub fn socket_path<'a>(env: &'a [String], socket_env: &str, default_path: &'a str) -> &'a str {
    env.iter()
        .find_map(|entry| {
            entry
                .strip_prefix(socket_env)
                .and_then(|rest| rest.strip_prefix('='))
                .filter(|value| !value.is_empty())
        })
        .unwrap_or(default_path)
}

/// Sleep seam so the scheduling loop can run against a fake clock
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one discovery cycle
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Containers an injection was started for
    pub started: Vec<String>,
    /// Containers skipped because an injection is already in flight
    pub skipped: usize,
    /// Containers whose attempt was abandoned
    pub failed: usize,
    /// Relay tasks started this cycle
    pub sessions: Vec<JoinHandle<()>>,
}

/// Drives discovery, deployment and relay hand-off
pub struct InjectionCoordinator<R, C, S = TokioSleeper>
where
    R: RuntimeAdapter + 'static,
    C: AgentConnector + 'static,
    S: Sleeper,
{
    runtime: Arc<R>,
    registry: InjectionRegistry,
    deployer: PayloadDeployer<R>,
    relay: Arc<RelayEngine<R, C>>,
    settings: DiscoverySettings,
    sleeper: S,
}

impl<R, C> InjectionCoordinator<R, C, TokioSleeper>
where
    R: RuntimeAdapter + 'static,
    C: AgentConnector + 'static,
{
    /// Create a new coordinator with an empty registry
    pub fn new(
        runtime: Arc<R>,
        deployer: PayloadDeployer<R>,
        relay: RelayEngine<R, C>,
        settings: DiscoverySettings,
    ) -> Self {
        Self::with_sleeper(runtime, deployer, relay, settings, TokioSleeper)
    }
}

impl<R, C, S> InjectionCoordinator<R, C, S>
where
    R: RuntimeAdapter + 'static,
    C: AgentConnector + 'static,
    S: Sleeper,
{
    /// Create a new coordinator using a custom sleeper
    pub fn with_sleeper(
        runtime: Arc<R>,
        deployer: PayloadDeployer<R>,
        relay: RelayEngine<R, C>,
        settings: DiscoverySettings,
        sleeper: S,
    ) -> Self {
        Self {
            runtime,
            registry: InjectionRegistry::new(),
            deployer,
            relay: Arc::new(relay),
            settings,
            sleeper,
        }
    }

    /// Registry of in-flight injections
    pub fn registry(&self) -> &InjectionRegistry {
        &self.registry
    }

    /// Run discovery forever. Scan failures are logged and retried after the
    /// backoff interval.
    pub async fn run(&self) {
        info!(
            label = %self.settings.injection_label,
            runtime = %self.runtime.runtime_type(),
            "Watching for containers"
        );

        loop {
            let delay = self.tick().await;
            self.sleeper.sleep(delay).await;
        }
    }

    /// Run one discovery cycle and return the delay before the next one
    pub async fn tick(&self) -> Duration {
        match self.scan().await {
            Ok(report) => {
                if !report.started.is_empty() || report.failed > 0 {
                    debug!(
                        started = report.started.len(),
                        skipped = report.skipped,
                        failed = report.failed,
                        "Scan complete"
                    );
                }
                self.settings.poll_interval
            }
            Err(e) => {
                error!(error = %e, "Container scan failed");
                self.settings.backoff_interval
            }
        }
    }

    /// List eligible containers and start an injection for each new one
    pub async fn scan(&self) -> Result<ScanReport, InjectError> {
        let containers = self
            .runtime
            .list_labeled(&self.settings.injection_label)
            .await
            .map_err(InjectError::Directory)?;

        let mut report = ScanReport::default();
        for container in containers
            .iter()
            .filter(|c| is_eligible(c, &self.settings.injection_label))
        {
            match self.inject(container).await {
                Ok(Some(session)) => {
                    report.started.push(container.id.clone());
                    report.sessions.push(session);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(
                        container_id = %container.id,
                        stage = e.stage(),
                        error = %e,
                        "Injection attempt abandoned"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Claim, deploy and hand off one container.
    ///
    /// Returns `None` if the container already has an injection in flight.
    /// On any failure the claim is dropped so a later scan retries.
    async fn inject(&self, container: &ContainerInfo) -> Result<Option<JoinHandle<()>>, InjectError> {
        let Some(claim) = self.registry.claim(&container.id) else {
            return Ok(None);
        };
        debug!(container_id = %container.id, name = %container.name, "Starting ssh-agent injection");

        let env = self
            .runtime
            .inspect_env(&container.id)
            .await
            .map_err(InjectError::Inspect)?;

        let target = InjectionTarget {
            container_id: container.id.clone(),
            user: target_user(
                &container.labels,
                &self.settings.user_label,
                &self.settings.default_user,
            )
            .to_string(),
            socket_path: socket_path(
                &env,
                &self.settings.socket_env,
                &self.settings.default_socket_path,
            )
            .to_string(),
        };

        self.deployer.deploy(&container.id).await?;

        let relay = self.relay.clone();
        let session = tokio::spawn(async move {
            let result = relay.run(&target).await;
            let claimed_ms = (Utc::now() - claim.claimed_at()).num_milliseconds();
            match result {
                Ok(report) => debug!(
                    container_id = %claim.container_id(),
                    cause = ?report.cause,
                    exit_code = ?report.exit_code,
                    exited = report.exited,
                    duration_ms = report.duration.as_millis() as u64,
                    claimed_ms,
                    "Relay session finished"
                ),
                Err(e) => error!(
                    container_id = %claim.container_id(),
                    stage = e.stage(),
                    error = %e,
                    claimed_ms,
                    "Relay session failed"
                ),
            }
        });

        Ok(Some(session))
    }
}
