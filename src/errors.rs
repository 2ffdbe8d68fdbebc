//! Error types for the deployment pipeline.

use reqwest::StatusCode;
use thiserror::Error;

use crate::deploy::DeploymentPhase;
use crate::runtime::InstanceHandle;

/// Every port in the configured range is excluded or already reserved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no free port in range {start}-{end}")]
pub struct PortExhaustionError {
    pub start: u16,
    pub end: u16,
}

/// Failure reported by the container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
#[error("failed to start instance on port {port}: {source}")]
pub struct InstanceStartError {
    pub port: u16,
    pub source: RuntimeError,
}

/// Non-fatal: raised while retiring an instance that no longer serves traffic.
#[derive(Error, Debug)]
#[error("failed to stop instance {handle}: {source}")]
pub struct InstanceStopError {
    pub handle: InstanceHandle,
    pub source: RuntimeError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{target} not healthy after {attempts} attempt(s); last observed: {last}")]
pub struct HealthCheckTimeoutError {
    pub target: String,
    pub attempts: u32,
    pub last: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error(transparent)]
    TimedOut(#[from] HealthCheckTimeoutError),

    #[error("health check cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum ProxyPushError {
    /// The admin API answered but refused the configuration. Never retried.
    #[error("proxy rejected configuration ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("proxy admin API unreachable after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        source: reqwest::Error,
    },

    #[error("configuration push cancelled")]
    Cancelled,
}

/// Terminal error of a deployment run.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    PortExhaustion(#[from] PortExhaustionError),

    #[error(transparent)]
    InstanceStart(#[from] InstanceStartError),

    #[error("health check failed: {0}")]
    HealthCheck(#[from] HealthCheckTimeoutError),

    #[error("proxy push failed: {0}")]
    ProxyPush(#[from] ProxyPushError),

    #[error("deployment cancelled during {phase}")]
    Cancelled { phase: DeploymentPhase },

    #[error("deployment deadline exceeded during {phase}")]
    TimedOut { phase: DeploymentPhase },
}

impl DeployError {
    /// The stage the run was in when it failed.
    pub fn phase(&self) -> DeploymentPhase {
        match self {
            DeployError::PortExhaustion(_) => DeploymentPhase::Idle,
            DeployError::InstanceStart(_) => DeploymentPhase::InstanceStarting,
            DeployError::HealthCheck(_) => DeploymentPhase::HealthChecking,
            DeployError::ProxyPush(_) => DeploymentPhase::Promoting,
            DeployError::Cancelled { phase } | DeployError::TimedOut { phase } => *phase,
        }
    }

    /// Terminal state the run ended in.
    pub fn outcome(&self) -> DeploymentPhase {
        match self.phase() {
            DeploymentPhase::HealthChecking => DeploymentPhase::RolledBack,
            _ => DeploymentPhase::Failed,
        }
    }
}
