use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use secrecy::Secret;
use sysinfo::System;
use tokio::process::Child;
use tokio::process::Command;

use crate::configuration::AgentSettings;
use crate::errors::DispatcherError;
use crate::provider::credentials::spawn_injector;
use crate::provider::credentials::AgentCredentials;
use crate::provider::stage_provider_ca;
use crate::provider::AgentMemoryUsage;
use crate::provider::AgentState;
use crate::provider::AgentStatus;
use crate::provider::MemoryUsage;
use crate::provider::Provider;
use crate::provider::PROVIDER_CA_FILE;
use crate::users::UserConfig;
use crate::watchdog::Watchdog;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningAgent {
    child: Child,
    port: u16,
}

/// Backend that spawns the agent binary directly and tracks it by OS process
/// id. Memory accounting reads each child's resident set via `sysinfo`.
pub struct ForkProvider {
    agent: AgentSettings,
    leap_provider_hostname: String,
    ca_bundle: Option<PathBuf>,
    initializing: AtomicBool,
    running: Mutex<HashMap<String, RunningAgent>>,
    credentials: Mutex<HashMap<String, Secret<String>>>,
    system: Mutex<System>,
}

impl ForkProvider {
    pub fn new(
        agent: AgentSettings,
        leap_provider_hostname: String,
        ca_bundle: Option<PathBuf>,
    ) -> Self {
        Self {
            agent,
            leap_provider_hostname,
            ca_bundle,
            initializing: AtomicBool::new(true),
            running: Mutex::new(HashMap::new()),
            credentials: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    fn guard_initializing(&self) -> Result<(), DispatcherError> {
        match self.initializing() {
            true => Err(DispatcherError::ProviderInitializing),
            false => Ok(()),
        }
    }

    /// Drop bookkeeping for agents that exited on their own. Crash detection
    /// is lazy: callers observe the disappearance on their next status query.
    fn reap(&self) {
        let mut running = self.running.lock().unwrap();
        running.retain(|name, agent| match agent.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(agent = %name, %status, "agent exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(agent = %name, error = %e, "failed to poll agent process");
                true
            }
        });
    }

    fn rss_of(
        &self,
        pid: u32,
    ) -> u64 {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap();
        match system.refresh_process(pid) {
            true => system.process(pid).map(|p| p.memory()).unwrap_or(0),
            false => 0,
        }
    }

    /// Starting an agent when the host is low on memory only trades one
    /// failure for a worse one, so refuse upfront.
    fn ensure_free_memory(&self) -> Result<(), DispatcherError> {
        let average = {
            let running = self.running.lock().unwrap();
            let pids: Vec<u32> = running.values().filter_map(|a| a.child.id()).collect();
            match pids.len() {
                0 => 0,
                n => pids.iter().map(|pid| self.rss_of(*pid)).sum::<u64>() / n as u64,
            }
        };
        let required = average.max(self.agent.min_free_memory_bytes);

        let available = {
            let mut system = self.system.lock().unwrap();
            system.refresh_memory();
            system.available_memory()
        };
        if available < required {
            tracing::warn!(available, required, "refusing to start agent");
            return Err(DispatcherError::NotEnoughFreeMemory);
        }
        Ok(())
    }

    fn agent_command(
        &self,
        user: &UserConfig,
        port: u16,
    ) -> Command {
        let data = user.data_path();
        let mut command = Command::new(&self.agent.bin);
        command
            .arg("--leap-home")
            .arg(&data)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--organization-mode");
        if self.ca_bundle.is_some() {
            command
                .arg("--leap-provider-cert")
                .arg(data.join(PROVIDER_CA_FILE));
        }
        command
            .env("DISPATCHER_LOGOUT_URL", "/auth/logout")
            .env(
                "FEEDBACK_URL",
                format!("https://{}/tickets", self.leap_provider_hostname),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

#[async_trait]
impl Provider for ForkProvider {
    fn initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), DispatcherError> {
        // nothing to build or pull; flip the flag so lifecycle ops unlock
        self.initializing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start(
        &self,
        user: &UserConfig,
        port: u16,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        if self.running.lock().unwrap().contains_key(&user.name) {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        self.ensure_free_memory()?;
        stage_provider_ca(user, self.ca_bundle.as_deref())?;

        let mut child = self
            .agent_command(user, port)
            .spawn()
            .with_context(|| format!("failed to spawn agent binary {:?}", self.agent.bin))?;
        let stdin = child
            .stdin
            .take()
            .context("agent child process has no stdin pipe")?;

        let staged = self.credentials.lock().unwrap().remove(&user.name);
        match staged {
            Some(password) => {
                spawn_injector(
                    stdin,
                    AgentCredentials {
                        user: user.name.clone(),
                        password,
                        leap_provider_hostname: self.leap_provider_hostname.clone(),
                    },
                );
            }
            // no staged credentials: close stdin so the agent sees EOF
            None => drop(stdin),
        }

        tracing::info!(agent = %user.name, port, pid = ?child.id(), "agent started");
        self.running
            .lock()
            .unwrap()
            .insert(user.name.clone(), RunningAgent { child, port });
        Ok(())
    }

    async fn stop(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        let mut agent = self
            .running
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| DispatcherError::InstanceNotRunning(name.to_string()))?;
        self.credentials.lock().unwrap().remove(name);

        if let Some(pid) = agent.child.id() {
            let pid = Pid::from_raw(pid as i32);
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                tracing::warn!(agent = %name, error = %e, "failed to signal agent");
            }
            let escalate = {
                let name = name.to_string();
                move || {
                    tracing::warn!(agent = %name, "agent ignored SIGTERM, killing");
                    let _ = signal::kill(pid, Signal::SIGKILL);
                }
            };
            let mut watchdog = Watchdog::new(STOP_TIMEOUT, escalate);
            agent
                .child
                .wait()
                .await
                .context("failed to reap agent process")?;
            watchdog.stop();
        }
        tracing::info!(agent = %name, "agent stopped");
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>, DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        let mut names: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn status(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        let running = self.running.lock().unwrap();
        Ok(match running.get(name) {
            Some(agent) => AgentStatus {
                state: AgentState::Running,
                port: Some(agent.port),
            },
            None => AgentStatus::stopped(),
        })
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        let pids: Vec<(String, Option<u32>)> = {
            let running = self.running.lock().unwrap();
            running
                .iter()
                .map(|(name, agent)| (name.clone(), agent.child.id()))
                .collect()
        };
        let mut agents: Vec<AgentMemoryUsage> = pids
            .into_iter()
            .map(|(name, pid)| AgentMemoryUsage {
                name,
                memory_usage: pid.map(|pid| self.rss_of(pid)).unwrap_or(0),
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(MemoryUsage::aggregate(agents))
    }

    fn pass_credentials(
        &self,
        name: &str,
        password: Secret<String>,
    ) {
        self.credentials
            .lock()
            .unwrap()
            .insert(name.to_string(), password);
    }

    async fn reset_data(
        &self,
        user: &UserConfig,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        if self.running.lock().unwrap().contains_key(&user.name) {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        // no residue beyond the data directory, which the registry wipes
        Ok(())
    }

    async fn remove(
        &self,
        user: &UserConfig,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        self.reap();
        if self.running.lock().unwrap().contains_key(&user.name) {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        self.credentials.lock().unwrap().remove(&user.name);
        Ok(())
    }
}
