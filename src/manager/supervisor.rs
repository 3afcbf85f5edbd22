use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::DispatcherError;
use crate::ports::PortPool;
use crate::provider::AgentState;
use crate::provider::AgentStatus;
use crate::provider::MemoryUsage;
use crate::provider::Provider;
use crate::users::UserRegistry;

#[derive(Debug, Clone, Copy)]
struct Instance {
    state: AgentState,
    port: u16,
    started_at: std::time::Instant,
}

/// Canonical per-user lifecycle state, layered over the provider backend.
///
/// All mutating operations on one user are serialized by a per-user async
/// mutex; operations on distinct users proceed in parallel. The supervisor is
/// the only writer of instance state and the only caller of the port pool:
/// a port is acquired *before* the instance enters `starting` and released
/// only *after* it returns to `stopped`, so a port can never be shared.
pub struct LifecycleSupervisor {
    provider: Arc<dyn Provider>,
    ports: PortPool,
    users: UserRegistry,
    instances: Mutex<HashMap<String, Instance>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LifecycleSupervisor {
    pub fn new(
        provider: Arc<dyn Provider>,
        ports: PortPool,
        users: UserRegistry,
    ) -> Self {
        Self {
            provider,
            ports,
            users,
            instances: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    fn user_lock(
        &self,
        name: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn guard_initializing(&self) -> Result<(), DispatcherError> {
        match self.provider.initializing() {
            true => Err(DispatcherError::ProviderInitializing),
            false => Ok(()),
        }
    }

    fn believed(
        &self,
        name: &str,
    ) -> Option<Instance> {
        self.instances.lock().unwrap().get(name).copied()
    }

    #[tracing::instrument(name = "Starting agent", skip(self))]
    pub async fn start(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError> {
        let user = self.users.get(name)?;
        let lock = self.user_lock(name);
        let _guard = lock.lock().await;
        self.guard_initializing()?;

        if self.believed(name).is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(name.to_string()));
        }
        // on any failure below the port goes straight back to the pool and
        // the instance record disappears, i.e. the state stays `stopped`
        let port = self.ports.acquire()?;
        self.instances.lock().unwrap().insert(
            name.to_string(),
            Instance {
                state: AgentState::Starting,
                port,
                started_at: std::time::Instant::now(),
            },
        );
        match self.provider.start(&user, port).await {
            Ok(()) => {
                let mut instances = self.instances.lock().unwrap();
                if let Some(instance) = instances.get_mut(name) {
                    instance.state = AgentState::Running;
                }
                Ok(AgentStatus {
                    state: AgentState::Running,
                    port: Some(port),
                })
            }
            Err(e) => {
                self.instances.lock().unwrap().remove(name);
                self.ports.release(port);
                Err(e)
            }
        }
    }

    #[tracing::instrument(name = "Stopping agent", skip(self))]
    pub async fn stop(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError> {
        self.users.get(name)?;
        let lock = self.user_lock(name);
        let _guard = lock.lock().await;
        self.guard_initializing()?;

        let instance = self
            .believed(name)
            .ok_or_else(|| DispatcherError::InstanceNotRunning(name.to_string()))?;
        if let Some(existing) = self.instances.lock().unwrap().get_mut(name) {
            existing.state = AgentState::Stopping;
        }
        match self.provider.stop(name).await {
            // a backend that already lost the agent counts as stopped
            Ok(()) | Err(DispatcherError::InstanceNotRunning(_)) => {
                self.instances.lock().unwrap().remove(name);
                self.ports.release(instance.port);
                tracing::info!(
                    agent = %name,
                    uptime_s = instance.started_at.elapsed().as_secs(),
                    "agent stopped"
                );
                Ok(AgentStatus::stopped())
            }
            Err(e) => {
                if let Some(existing) = self.instances.lock().unwrap().get_mut(name) {
                    existing.state = instance.state;
                }
                Err(e)
            }
        }
    }

    /// Runtime view with lazy crash detection: a backend that no longer
    /// reports the agent while we believe it is up reconciles to `stopped`
    /// and frees the port.
    pub async fn runtime(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError> {
        self.users.get(name)?;
        let lock = self.user_lock(name);
        let _guard = lock.lock().await;
        self.guard_initializing()?;

        let Some(instance) = self.believed(name) else {
            return Ok(AgentStatus::stopped());
        };
        let backend = self.provider.status(name).await?;
        if backend.state == AgentState::Stopped {
            tracing::warn!(agent = %name, "agent vanished from the backend, reconciling");
            self.instances.lock().unwrap().remove(name);
            self.ports.release(instance.port);
            return Ok(AgentStatus::stopped());
        }
        Ok(AgentStatus {
            state: instance.state,
            port: Some(instance.port),
        })
    }

    /// Believed state without backend round-trips or reconciliation.
    pub fn state_of(
        &self,
        name: &str,
    ) -> Result<AgentState, DispatcherError> {
        self.users.get(name)?;
        Ok(self
            .believed(name)
            .map(|i| i.state)
            .unwrap_or(AgentState::Stopped))
    }

    /// Registry listing decorated with the believed state; cheap on purpose
    /// (no backend round-trips), crash reconciliation happens in `runtime`.
    pub fn list(&self) -> Result<Vec<(String, AgentState)>, DispatcherError> {
        let names = self.users.list()?;
        let instances = self.instances.lock().unwrap();
        Ok(names
            .into_iter()
            .map(|name| {
                let state = instances
                    .get(&name)
                    .map(|i| i.state)
                    .unwrap_or(AgentState::Stopped);
                (name, state)
            })
            .collect())
    }

    #[tracing::instrument(name = "Removing agent", skip(self))]
    pub async fn remove(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        let user = self.users.get(name)?;
        let lock = self.user_lock(name);
        let _guard = lock.lock().await;

        if self.believed(name).is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(name.to_string()));
        }
        self.provider.remove(&user).await?;
        self.users.remove(name)?;
        self.locks.lock().unwrap().remove(name);
        Ok(())
    }

    #[tracing::instrument(name = "Resetting agent data", skip(self))]
    pub async fn reset_data(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        let user = self.users.get(name)?;
        let lock = self.user_lock(name);
        let _guard = lock.lock().await;

        if self.believed(name).is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(name.to_string()));
        }
        self.provider.reset_data(&user).await?;
        self.users.reset(name)
    }

    pub async fn memory_usage(&self) -> Result<MemoryUsage, DispatcherError> {
        self.provider.memory_usage().await
    }
}
