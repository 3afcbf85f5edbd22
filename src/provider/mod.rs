pub mod credentials;
pub mod docker;
pub mod fork;

use async_trait::async_trait;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::DispatcherError;
use crate::users::UserConfig;

/// Observable lifecycle state of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for AgentState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(state)
    }
}

/// Runtime projection of one agent as the backend sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl AgentStatus {
    pub fn stopped() -> Self {
        Self {
            state: AgentState::Stopped,
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryUsage {
    pub name: String,
    pub memory_usage: u64,
}

/// Resident-set aggregation across all running agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_usage: u64,
    pub average_usage: u64,
    pub agents: Vec<AgentMemoryUsage>,
}

impl MemoryUsage {
    /// The average runs over every listed agent, zero-usage ones included.
    pub fn aggregate(agents: Vec<AgentMemoryUsage>) -> Self {
        let total_usage: u64 = agents.iter().map(|a| a.memory_usage).sum();
        let average_usage = match agents.len() {
            0 => 0,
            n => total_usage / n as u64,
        };
        Self {
            total_usage,
            average_usage,
            agents,
        }
    }
}

/// Contract between the lifecycle supervisor and an isolation backend.
///
/// Implementations supervise at most one agent per user. `initialize` may
/// take minutes (image build/pull); while it runs, `initializing()` is true
/// and every other operation fails with `ProviderInitializing` so callers can
/// surface "503 Initializing" instead of spurious errors.
///
/// `reset_data`/`remove` drop backend residue (stale containers, process
/// bookkeeping) for a user whose on-disk state the registry is about to wipe;
/// both refuse while the agent runs.
#[async_trait]
pub trait Provider: Send + Sync {
    fn initializing(&self) -> bool;

    /// Idempotent; concurrent callers fail fast with `ProviderInitializing`.
    async fn initialize(&self) -> Result<(), DispatcherError>;

    /// Launch the agent bound to `127.0.0.1:port`. Returns once the process
    /// is launched; it need not be listening yet. Staged credentials are
    /// consumed and delivered on the agent's stdin.
    async fn start(
        &self,
        user: &UserConfig,
        port: u16,
    ) -> Result<(), DispatcherError>;

    /// Graceful stop with a 10 s deadline, then forceful kill.
    async fn stop(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError>;

    async fn list_running(&self) -> Result<Vec<String>, DispatcherError>;

    async fn status(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError>;

    async fn memory_usage(&self) -> Result<MemoryUsage, DispatcherError>;

    /// Stage credentials to be delivered on the next `start`. Staging is
    /// process-local and wiped once delivered.
    fn pass_credentials(
        &self,
        name: &str,
        password: Secret<String>,
    );

    async fn reset_data(
        &self,
        user: &UserConfig,
    ) -> Result<(), DispatcherError>;

    async fn remove(
        &self,
        user: &UserConfig,
    ) -> Result<(), DispatcherError>;
}

/// Copy a path-backed provider CA into the agent's data root so the agent
/// finds it at a known in-sandbox path.
pub const PROVIDER_CA_FILE: &str = "dispatcher-leap-provider-ca.crt";

pub(crate) fn stage_provider_ca(
    user: &UserConfig,
    ca_bundle: Option<&std::path::Path>,
) -> Result<(), DispatcherError> {
    use anyhow::Context;
    if let Some(ca_bundle) = ca_bundle {
        let target = user.data_path().join(PROVIDER_CA_FILE);
        std::fs::copy(ca_bundle, &target).with_context(|| {
            format!(
                "failed to copy provider CA {} to {}",
                ca_bundle.display(),
                target.display()
            )
        })?;
    }
    Ok(())
}
