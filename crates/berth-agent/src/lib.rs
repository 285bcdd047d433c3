//! Container orchestration and telemetry for managed game servers.

pub mod config;
pub mod docker;
pub mod error;
pub mod events;
mod exec;
pub mod images;
pub mod lifecycle;
pub mod logs;
pub mod rcon;
pub mod registry;
pub mod runtime;
pub mod stats;

mod support;
#[cfg(test)]
mod testing;

pub use config::{ImageConfig, ImageSource, OrchestratorConfig};
pub use docker::DockerRuntime;
pub use error::OrchestratorError;
pub use events::{EventSink, NoopSink, SubscriptionSource};
pub use lifecycle::{CreatePolicy, Orchestrator};
pub use logs::LogFrom;
pub use rcon::RconError;
pub use runtime::{ContainerRuntime, RuntimeError};
pub use stats::{StatsBroadcaster, StatsHandle};
pub use support::format_error_chain;
