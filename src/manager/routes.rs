use actix_web::web;
use actix_web::HttpResponse;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::DispatcherError;
use crate::leap::srp::LeapAuthError;
use crate::manager::startup::ManagerState;
use crate::provider::AgentState;
use crate::users::UserName;

#[derive(Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub state: AgentState,
}

#[derive(Serialize)]
struct AgentList {
    agents: Vec<AgentSummary>,
}

/// `GET /agents`
pub async fn list_agents(
    state: web::Data<ManagerState>
) -> Result<HttpResponse, DispatcherError> {
    let agents = state
        .supervisor
        .list()?
        .into_iter()
        .map(|(name, state)| AgentSummary { name, state })
        .collect();
    Ok(HttpResponse::Ok().json(AgentList { agents }))
}

#[derive(Deserialize)]
pub struct AddAgentBody {
    name: String,
    password: Secret<String>,
}

/// `POST /agents`
///
/// Creates the local user, registers the SRP verifier with the identity
/// provider, and stages the credentials for the first start. A rejected
/// upstream registration rolls the local directory back so both sides agree.
#[tracing::instrument(name = "Adding agent", skip_all)]
pub async fn add_agent(
    state: web::Data<ManagerState>,
    body: web::Json<AddAgentBody>,
) -> Result<HttpResponse, DispatcherError> {
    let body = body.into_inner();
    let name = UserName::parse(&body.name).map_err(DispatcherError::Validation)?;

    state.users.add(&name)?;
    if let Err(e) = state.srp.register(name.as_ref(), &body.password).await {
        if let Err(rollback) = state.users.remove(name.as_ref()) {
            tracing::error!(error.cause_chain = ?rollback, agent = %name, "failed to roll back user add");
        }
        return Err(match e {
            LeapAuthError::UserExists => DispatcherError::Exists(name.to_string()),
            LeapAuthError::AuthFailed(e) => {
                DispatcherError::Unexpected(e.context("provider registration failed"))
            }
        });
    }
    state
        .supervisor
        .provider()
        .pass_credentials(name.as_ref(), body.password);

    tracing::info!(agent = %name, "agent added");
    Ok(HttpResponse::Created().json(AgentSummary {
        name: name.to_string(),
        state: AgentState::Stopped,
    }))
}

/// `GET /agents/{name}`
pub async fn get_agent(
    state: web::Data<ManagerState>,
    name: web::Path<String>,
) -> Result<HttpResponse, DispatcherError> {
    let name = name.into_inner();
    let agent_state = state.supervisor.state_of(&name)?;
    Ok(HttpResponse::Ok().json(AgentSummary {
        name,
        state: agent_state,
    }))
}

/// `GET /agents/{name}/runtime`
pub async fn agent_runtime(
    state: web::Data<ManagerState>,
    name: web::Path<String>,
) -> Result<HttpResponse, DispatcherError> {
    let runtime = state.supervisor.runtime(&name).await?;
    Ok(HttpResponse::Ok().json(runtime))
}

#[derive(Deserialize)]
pub struct AgentStateBody {
    state: DesiredState,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum DesiredState {
    Running,
    Stopped,
}

/// `PUT /agents/{name}/state`
pub async fn put_agent_state(
    state: web::Data<ManagerState>,
    name: web::Path<String>,
    body: web::Json<AgentStateBody>,
) -> Result<HttpResponse, DispatcherError> {
    let status = match body.state {
        DesiredState::Running => state.supervisor.start(&name).await?,
        DesiredState::Stopped => state.supervisor.stop(&name).await?,
    };
    Ok(HttpResponse::Ok().json(status))
}

#[derive(Deserialize)]
pub struct ResetDataBody {
    name: String,
}

/// `PUT /agents/{name}/reset_data`
pub async fn reset_agent_data(
    state: web::Data<ManagerState>,
    name: web::Path<String>,
    body: web::Json<ResetDataBody>,
) -> Result<HttpResponse, DispatcherError> {
    if body.name != *name {
        return Err(DispatcherError::Validation(
            "body and path disagree on the agent name".to_string(),
        ));
    }
    state.supervisor.reset_data(&name).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({})))
}

#[derive(Deserialize)]
pub struct AuthenticateBody {
    password: Secret<String>,
}

/// `POST /agents/{name}/authenticate`
///
/// SRP check against the identity provider; a success stages the verified
/// credentials so the next start can hand them to the agent.
#[tracing::instrument(name = "Authenticating agent", skip(state, body))]
pub async fn authenticate_agent(
    state: web::Data<ManagerState>,
    name: web::Path<String>,
    body: web::Json<AuthenticateBody>,
) -> Result<HttpResponse, DispatcherError> {
    let user = state.users.get(&name)?;
    let body = body.into_inner();
    state
        .srp
        .authenticate(&user.name, &body.password)
        .await
        .map_err(|e| match e {
            LeapAuthError::AuthFailed(e) => DispatcherError::AuthFailed(e),
            LeapAuthError::UserExists => {
                DispatcherError::Unexpected(anyhow::anyhow!("unexpected registration conflict"))
            }
        })?;
    state
        .supervisor
        .provider()
        .pass_credentials(&user.name, body.password);
    Ok(HttpResponse::NoContent().finish())
}

/// `GET /stats/memory_usage`
pub async fn memory_usage(
    state: web::Data<ManagerState>
) -> Result<HttpResponse, DispatcherError> {
    let usage = state.supervisor.memory_usage().await?;
    Ok(HttpResponse::Ok().json(usage))
}
