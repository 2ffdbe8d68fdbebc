//! Health-gated cutover from the active instance to a new one.
//!
//! One run walks `Idle → PortAllocated → InstanceStarting → HealthChecking →
//! Promoting → Draining → Completed`. Anything that goes wrong before the
//! proxy push leaves production untouched; once the push has succeeded the
//! run is never reverted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caddy_client::ProxyAdmin;
use crate::caddyfile::ProxyConfigBuilder;
use crate::config::DeploymentConfig;
use crate::errors::{
    DeployError, HealthCheckError, InstanceStartError, InstanceStopError, ProxyPushError,
    RuntimeError,
};
use crate::health::{HealthCheck, HealthPolicy};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, InstanceHandle, InstanceSpec, RunningInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Idle,
    PortAllocated,
    InstanceStarting,
    HealthChecking,
    Promoting,
    Draining,
    Completed,
    RolledBack,
    Failed,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::PortAllocated => "port_allocated",
            DeploymentPhase::InstanceStarting => "instance_starting",
            DeploymentPhase::HealthChecking => "health_checking",
            DeploymentPhase::Promoting => "promoting",
            DeploymentPhase::Draining => "draining",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::RolledBack => "rolled_back",
            DeploymentPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cross-run state owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentState {
    pub generation: u64,
    pub phase: DeploymentPhase,
    /// Port reserved for the instance being brought up, if a run is in flight.
    pub allocated_port: Option<u16>,
    /// Port referenced by the live proxy configuration.
    pub active_port: Option<u16>,
    pub active_instance: Option<InstanceHandle>,
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self {
            generation: 0,
            phase: DeploymentPhase::Idle,
            allocated_port: None,
            active_port: None,
            active_instance: None,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub app: String,
    pub generation: u64,
    pub phase: DeploymentPhase,
    pub port: u16,
    pub instance: InstanceHandle,
    pub health_attempts: u32,
    pub previous_port: Option<u16>,
    /// Set when the previous instance could not be stopped.
    pub drain_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Inner {
    state: DeploymentState,
    ports: PortAllocator,
}

impl Inner {
    fn enter(&mut self, generation: u64, phase: DeploymentPhase) {
        tracing::debug!(generation, from = %self.state.phase, to = %phase, "deployment transition");
        self.state.phase = phase;
    }

    /// Forget the in-flight port after a failed or rolled back run. The port
    /// stays reserved unless its instance is known to be gone.
    fn abandon(&mut self, port: u16, released: bool, outcome: DeploymentPhase) {
        if released {
            self.ports.release(port);
        }
        self.state.allocated_port = None;
        self.state.phase = outcome;
    }
}

/// Cancels `token` once `after` has elapsed, unless dropped first.
struct Deadline(JoinHandle<()>);

impl Deadline {
    fn arm(token: CancellationToken, after: Duration) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        }))
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs deployments for one application, one at a time.
pub struct DeploymentCoordinator {
    config: DeploymentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ProxyAdmin>,
    health: Arc<dyn HealthCheck>,
    builder: ProxyConfigBuilder,
    health_policy: HealthPolicy,
    deadline: Option<Duration>,
    inner: Mutex<Inner>,
}

impl DeploymentCoordinator {
    pub fn new(
        config: DeploymentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn ProxyAdmin>,
        health: Arc<dyn HealthCheck>,
    ) -> Self {
        let builder = ProxyConfigBuilder::new(config.caddy.listen.clone());
        let health_policy = config.health_check.policy();
        let ports = PortAllocator::new(config.app.port_range);
        Self {
            config,
            runtime,
            proxy,
            health,
            builder,
            health_policy,
            deadline: None,
            inner: Mutex::new(Inner {
                state: DeploymentState::default(),
                ports,
            }),
        }
    }

    /// Bound every run by `deadline`; expiry is handled like cancellation.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub async fn state(&self) -> DeploymentState {
        self.inner.lock().await.state.clone()
    }

    /// Adopt the instance the runtime reports as running for this app.
    pub async fn recover(&self) -> Result<Option<RunningInstance>, RuntimeError> {
        let mut inner = self.inner.lock().await;
        let running = self.runtime.find_running(&self.config.app.name).await?;
        if let Some(instance) = &running {
            if !self.config.app.port_range.contains(instance.host_port) {
                tracing::warn!(
                    port = instance.host_port,
                    "running instance is bound outside the configured port range"
                );
            }
            inner.ports.reserve(instance.host_port);
            inner.state.active_port = Some(instance.host_port);
            inner.state.active_instance = Some(instance.handle.clone());
            inner.state.generation = inner.state.generation.max(instance.generation);
            tracing::info!(
                app = %self.config.app.name,
                port = instance.host_port,
                instance = %instance.handle,
                "adopted running instance"
            );
        }
        Ok(running)
    }

    /// Run one deployment. Concurrent callers queue behind the one in flight.
    pub async fn deploy(&self, cancel: CancellationToken) -> Result<DeploymentReport, DeployError> {
        let mut inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DeployError::Cancelled { phase: DeploymentPhase::Idle });
            }
            inner = self.inner.lock() => inner,
        };

        let run = cancel.child_token();
        let _deadline = self.deadline.map(|after| Deadline::arm(run.clone(), after));
        let started_at = Utc::now();
        let app = &self.config.app;

        inner.state.generation += 1;
        let generation = inner.state.generation;
        inner.state.phase = DeploymentPhase::Idle;
        let previous_port = inner.state.active_port;
        let previous_instance = inner.state.active_instance.clone();
        tracing::info!(app = %app.name, generation, ?previous_port, "starting deployment");

        let port = match inner.ports.allocate(previous_port.as_slice()) {
            Ok(port) => port,
            Err(e) => {
                inner.state.phase = DeploymentPhase::Failed;
                tracing::error!(generation, error = %e, "port allocation failed");
                return Err(e.into());
            }
        };
        inner.state.allocated_port = Some(port);
        inner.enter(generation, DeploymentPhase::PortAllocated);

        inner.enter(generation, DeploymentPhase::InstanceStarting);
        let spec = InstanceSpec {
            app_name: &app.name,
            generation,
            image: &app.image,
            env: &app.env,
            host_port: port,
            container_port: app.container_port,
            network: app.network.as_deref(),
            registry: app.registry_credentials(),
        };
        // start runs to completion even when cancelled, so a container it
        // created is always handed back and can be torn down
        let handle = match self.runtime.start(&spec).await {
            Ok(handle) => handle,
            Err(source) => {
                inner.abandon(port, true, DeploymentPhase::Failed);
                let err = InstanceStartError { port, source };
                tracing::error!(generation, error = %err, "instance failed to start");
                return Err(err.into());
            }
        };
        if run.is_cancelled() {
            let released = self.discard(&handle).await;
            inner.abandon(port, released, DeploymentPhase::Failed);
            return Err(self.interrupted(&cancel, generation, DeploymentPhase::InstanceStarting));
        }

        inner.enter(generation, DeploymentPhase::HealthChecking);
        let target = self.config.health_check.target(port);
        let health_attempts = match self
            .health
            .wait_until_healthy(&target, &self.health_policy, &run)
            .await
        {
            Ok(attempts) => attempts,
            Err(err) => {
                let released = self.discard(&handle).await;
                inner.abandon(port, released, DeploymentPhase::RolledBack);
                return Err(match err {
                    HealthCheckError::TimedOut(e) => {
                        tracing::error!(generation, error = %e, "health check failed, rolled back");
                        e.into()
                    }
                    HealthCheckError::Cancelled { .. } => {
                        self.interrupted(&cancel, generation, DeploymentPhase::HealthChecking)
                    }
                });
            }
        };

        inner.enter(generation, DeploymentPhase::Promoting);
        let document = self.builder.build(&self.config.caddy.rules, port);
        if let Err(err) = self.proxy.push(&document, &run).await {
            let released = self.discard(&handle).await;
            inner.abandon(port, released, DeploymentPhase::Failed);
            return Err(match err {
                ProxyPushError::Cancelled => {
                    self.interrupted(&cancel, generation, DeploymentPhase::Promoting)
                }
                other => {
                    tracing::error!(generation, error = %other, "proxy push failed, new instance discarded");
                    other.into()
                }
            });
        }
        inner.state.active_port = Some(port);
        inner.state.active_instance = Some(handle.clone());
        inner.state.allocated_port = None;
        tracing::info!(generation, port, instance = %handle, "traffic promoted");

        // past this point the run cannot fail
        let mut drain_error = None;
        if let Some(old) = previous_instance {
            inner.enter(generation, DeploymentPhase::Draining);
            match self.runtime.stop(&old).await {
                Ok(()) => {
                    if let Some(old_port) = previous_port {
                        inner.ports.release(old_port);
                    }
                    tracing::info!(generation, instance = %old, "previous instance drained");
                }
                Err(source) => {
                    // keep its port reserved while the container may still hold it
                    let err = InstanceStopError {
                        handle: old,
                        source,
                    };
                    tracing::warn!(generation, error = %err, "previous instance did not stop");
                    drain_error = Some(err.to_string());
                }
            }
        }

        inner.enter(generation, DeploymentPhase::Completed);
        let report = DeploymentReport {
            app: app.name.clone(),
            generation,
            phase: DeploymentPhase::Completed,
            port,
            instance: handle,
            health_attempts,
            previous_port,
            drain_error,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(app = %app.name, generation, port, "deployment completed");
        Ok(report)
    }

    /// Teardown of an instance that never received traffic. Returns whether
    /// the instance is gone.
    async fn discard(&self, handle: &InstanceHandle) -> bool {
        match self.runtime.stop(handle).await {
            Ok(()) => true,
            Err(source) => {
                let err = InstanceStopError {
                    handle: handle.clone(),
                    source,
                };
                tracing::warn!(error = %err, "failed to stop unpromoted instance, keeping its port reserved");
                false
            }
        }
    }

    fn interrupted(
        &self,
        cancel: &CancellationToken,
        generation: u64,
        phase: DeploymentPhase,
    ) -> DeployError {
        if cancel.is_cancelled() {
            tracing::warn!(generation, %phase, "deployment cancelled");
            DeployError::Cancelled { phase }
        } else {
            tracing::warn!(generation, %phase, "deployment deadline exceeded");
            DeployError::TimedOut { phase }
        }
    }
}
