use std::time::Duration;

use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use crate::errors::error_chain_fmt;
use crate::provider::AgentState;
use crate::provider::AgentStatus;
use crate::provider::MemoryUsage;
use crate::tls::TlsOptions;

/// How often `validate_connection` retries the manager.
const VALIDATE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(thiserror::Error)]
pub enum ManagerClientError {
    /// The manager is up but its provider backend is still initializing.
    #[error("Manager is initializing")]
    Initializing,
    #[error("{code}: {reason}")]
    Http { code: u16, reason: String },
    #[error("Connection to manager failed")]
    Transport(#[source] reqwest::Error),
    #[error("Failed to connect to manager within {0:?}")]
    ConnectTimeout(Duration),
}

impl std::fmt::Debug for ManagerClientError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl From<reqwest::Error> for ManagerClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e)
    }
}

/// Classify a manager response status. `None` means the response is not an
/// error. Every 4xx/5xx maps to a declared kind, 503 being the special
/// "initializing" signal.
fn status_error(
    code: u16,
    reason: String,
) -> Option<ManagerClientError> {
    match code {
        503 => Some(ManagerClientError::Initializing),
        400..=599 => Some(ManagerClientError::Http { code, reason }),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Agent {
    pub name: String,
    pub state: AgentState,
}

#[derive(Deserialize)]
struct AgentList {
    agents: Vec<Agent>,
}

/// Strongly-typed HTTPS client for the manager's REST API, with the same TLS
/// options (CA bundle / hostname / fingerprint pin) as every other outbound
/// connection.
#[derive(Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(
        base_url: String,
        tls: &TlsOptions,
    ) -> Result<Self, anyhow::Error> {
        let http = crate::tls::build_client(tls, None)?;
        Ok(Self { http, base_url })
    }

    pub fn for_endpoint(
        hostname: &str,
        port: u16,
        use_ssl: bool,
        tls: &TlsOptions,
    ) -> Result<Self, anyhow::Error> {
        let scheme = if use_ssl { "https" } else { "http" };
        Self::new(format!("{scheme}://{hostname}:{port}"), tls)
    }

    async fn error_for_status(
        response: reqwest::Response
    ) -> Result<reqwest::Response, ManagerClientError> {
        let code = response.status().as_u16();
        let canonical = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        match status_error(code, String::new()) {
            None => Ok(response),
            Some(ManagerClientError::Http { .. }) => {
                let body = response.text().await.unwrap_or_default();
                let reason = if body.is_empty() { canonical } else { body };
                Err(ManagerClientError::Http { code, reason })
            }
            Some(e) => Err(e),
        }
    }

    async fn get(
        &self,
        path: &str,
    ) -> Result<reqwest::Response, ManagerClientError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::error_for_status(response).await
    }

    async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ManagerClientError> {
        let response = self
            .http
            .put(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        Self::error_for_status(response).await
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ManagerClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        Self::error_for_status(response).await
    }

    pub async fn list(&self) -> Result<Vec<Agent>, ManagerClientError> {
        let body: AgentList = self.get("/agents").await?.json().await?;
        Ok(body.agents)
    }

    pub async fn get_agent(
        &self,
        name: &str,
    ) -> Result<Agent, ManagerClientError> {
        Ok(self.get(&format!("/agents/{name}")).await?.json().await?)
    }

    pub async fn get_agent_runtime(
        &self,
        name: &str,
    ) -> Result<AgentStatus, ManagerClientError> {
        Ok(self
            .get(&format!("/agents/{name}/runtime"))
            .await?
            .json()
            .await?)
    }

    pub async fn start(
        &self,
        name: &str,
    ) -> Result<AgentStatus, ManagerClientError> {
        Ok(self
            .put(
                &format!("/agents/{name}/state"),
                &serde_json::json!({ "state": "running" }),
            )
            .await?
            .json()
            .await?)
    }

    pub async fn stop(
        &self,
        name: &str,
    ) -> Result<AgentStatus, ManagerClientError> {
        Ok(self
            .put(
                &format!("/agents/{name}/state"),
                &serde_json::json!({ "state": "stopped" }),
            )
            .await?
            .json()
            .await?)
    }

    pub async fn add(
        &self,
        name: &str,
        password: &Secret<String>,
    ) -> Result<(), ManagerClientError> {
        self.post(
            "/agents",
            &serde_json::json!({ "name": name, "password": password.expose_secret() }),
        )
        .await?;
        Ok(())
    }

    pub async fn authenticate(
        &self,
        name: &str,
        password: &Secret<String>,
    ) -> Result<(), ManagerClientError> {
        self.post(
            &format!("/agents/{name}/authenticate"),
            &serde_json::json!({ "password": password.expose_secret() }),
        )
        .await?;
        Ok(())
    }

    pub async fn reset_data(
        &self,
        name: &str,
    ) -> Result<(), ManagerClientError> {
        self.put(
            &format!("/agents/{name}/reset_data"),
            &serde_json::json!({ "name": name }),
        )
        .await?;
        Ok(())
    }

    pub async fn memory_usage(&self) -> Result<MemoryUsage, ManagerClientError> {
        Ok(self.get("/stats/memory_usage").await?.json().await?)
    }

    pub async fn agent_exists(
        &self,
        name: &str,
    ) -> Result<bool, ManagerClientError> {
        match self.get_agent(name).await {
            Ok(_) => Ok(true),
            Err(ManagerClientError::Http { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Poll `list` every 500 ms until the manager answers or the deadline
    /// passes. Connection refusals are retried; an initializing manager
    /// already counts as up.
    pub async fn validate_connection(
        &self,
        timeout: Duration,
    ) -> Result<(), ManagerClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.list().await {
                Ok(_) | Err(ManagerClientError::Initializing) => return Ok(()),
                Err(ManagerClientError::Transport(e)) if e.is_connect() => {
                    tracing::warn!(error = %e, "manager not reachable yet");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ManagerClientError::ConnectTimeout(timeout));
            }
            tokio::time::sleep(VALIDATE_RETRY_INTERVAL).await;
        }
    }
}
