pub mod caddy_client;
pub mod caddyfile;
pub mod config;
pub mod deploy;
pub mod docker_client;
pub mod errors;
pub mod health;
pub mod models;
pub mod ports;
pub mod runtime;

pub use caddy_client::{CaddyClient, ProxyAdmin, RetryPolicy};
pub use caddyfile::ProxyConfigBuilder;
pub use crate::config::DeploymentConfig;
pub use deploy::*;
pub use docker_client::DockerRuntime;
pub use errors::*;
pub use health::{HealthCheck, HealthPolicy, HealthProbe};
pub use models::*;
pub use ports::{PortAllocator, PortRange};
pub use runtime::*;
