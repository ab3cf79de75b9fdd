//! Inject module
//!
//! The injection lifecycle: discovery and dedup, payload deployment, and the
//! per-container relay session.

pub mod coordinator;
pub mod deploy;
pub mod registry;
pub mod relay;

pub use coordinator::{InjectionCoordinator, Sleeper, TokioSleeper};
pub use deploy::{Payload, PayloadDeployer};
pub use registry::{InjectionClaim, InjectionRegistry};
pub use relay::{InjectionTarget, RelayEngine, RelaySettings, SessionReport};
