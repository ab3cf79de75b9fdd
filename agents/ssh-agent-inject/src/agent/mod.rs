//! Agent module
//!
//! Access to the operator's local ssh-agent.

pub mod connector;

pub use connector::{AgentConnector, AgentStream, SocketAgentConnector};
