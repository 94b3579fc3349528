//! tunnelkeeper: keeps public tunnels to local HTTP services alive.
//!
//! Tunnel creation is delegated to external backends (ngrok, localhost.run);
//! this crate supervises them: it verifies established tunnels are actually
//! reachable, detects silent failures, and recovers by restarting the same
//! provider or failing over to the next one in the ring.

pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod provider;
pub mod status;
pub mod supervisor;

pub use config::{
    AppConfig, HealthCheckPolicy, LoggingConfig, ProviderOptions, SupervisorConfig, TunnelSpec,
};
pub use error::{Result, TunnelError};
pub use health::{HealthEvent, HealthProbe, HealthSnapshot};
pub use orchestrator::{Orchestrator, SpecProviderFactory};
pub use provider::{
    build_provider, ActiveEndpoint, EndpointRegistry, ProviderExit, ProviderKind, TunnelProvider,
};
pub use status::StatusServer;
pub use supervisor::{
    ProviderFactory, ProviderRing, TunnelEvent, TunnelStatus, TunnelSupervisor,
};
