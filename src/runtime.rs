//! Contract for the container runtime that hosts application instances.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::errors::RuntimeError;

/// Opaque runtime identifier of a started instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start one instance of the application.
#[derive(Debug)]
pub struct InstanceSpec<'a> {
    pub app_name: &'a str,
    pub generation: u64,
    pub image: &'a str,
    pub env: &'a [String],
    pub host_port: u16,
    pub container_port: u16,
    pub network: Option<&'a str>,
    pub registry: Option<&'a RegistryConfig>,
}

impl InstanceSpec<'_> {
    pub fn container_name(&self) -> String {
        format!("{}-{}-{}", self.app_name, self.generation, self.host_port)
    }
}

/// An instance found already running, e.g. from a previous process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    pub handle: InstanceHandle,
    pub host_port: u16,
    pub generation: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: &InstanceSpec<'_>) -> Result<InstanceHandle, RuntimeError>;

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), RuntimeError>;

    /// The newest running instance of `app_name`, if the runtime can tell.
    async fn find_running(&self, app_name: &str) -> Result<Option<RunningInstance>, RuntimeError> {
        let _ = app_name;
        Ok(None)
    }
}
