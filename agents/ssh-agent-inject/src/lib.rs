//! ssh-agent-inject Library
//!
//! Forwards the operator's local ssh-agent into running containers that opt
//! in through a label. A coordinator discovers eligible containers, copies a
//! small relay helper into each one, and relays bytes between the helper and
//! the host agent for as long as both sides stay open.

pub mod agent;
pub mod cli;
pub mod error;
pub mod inject;
pub mod runtime;

// Re-exports for convenience
pub use agent::connector::{AgentConnector, SocketAgentConnector};
pub use cli::config::Config;
pub use error::InjectError;
pub use inject::coordinator::InjectionCoordinator;
pub use inject::deploy::{Payload, PayloadDeployer};
pub use inject::registry::InjectionRegistry;
pub use inject::relay::RelayEngine;
pub use runtime::adapter::RuntimeAdapter;
pub use runtime::docker::adapter::DockerAdapter;
