mod client;
mod container;
mod executor;
pub mod format;
mod report;

pub use client::{CONNECT_ATTEMPTS, CONNECT_INTERVAL, Exchange, ExchangeClient, Outcome, SctClient};
pub use container::{
    CONTAINER_PORT, ContainerLifecycle, ContainerSpec, DockerCli, ExternalContainer, LifecycleLock,
};
pub use executor::{HostRequest, ProxyExecutor};
pub use report::{ErrorInfo, NO_RESULT, ReportSettings, Response, error_key, error_text, render};
