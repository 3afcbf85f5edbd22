use std::time::Duration;

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use futures_util::SinkExt;
use futures_util::StreamExt;
use secrecy::Secret;
use serde::Deserialize;

use crate::manager_client::ManagerClient;
use crate::manager_client::ManagerClientError;
use crate::provider::AgentState;
use crate::proxy::session::TypedSession;
use crate::proxy::startup::Banner;
use crate::proxy::startup::ForwardClient;
use crate::utils::error_500;
use crate::utils::redirect;

/// Deadline for the agent to produce response headers. Bodies stream without
/// a deadline afterwards.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(1);

/// Response headers relayed back to the browser; everything else, cookies
/// included, is dropped (the agent rides on the proxy's own session).
const RELAYED_HEADERS: [&str; 5] = ["Date", "Cache-Control", "Server", "Content-Type", "Location"];

/// Request headers not copied towards the agent: the forwarding client owns
/// connection management and body framing.
const HOP_HEADERS: [&str; 4] = ["host", "connection", "content-length", "transfer-encoding"];

const LOGIN_TEMPLATE: &str = include_str!("login.html");
const DISPATCHER_CSS: &str = include_str!("dispatcher.css");

#[derive(Deserialize)]
pub struct LoginQuery {
    error: Option<String>,
}

/// `GET /auth/login`
pub async fn login_form(
    session: TypedSession,
    banner: web::Data<Banner>,
    query: web::Query<LoginQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let xsrf_token = session.issue_xsrf_token().map_err(error_500)?;
    let mut context = tera::Context::new();
    context.insert("banner", &banner.0);
    context.insert("error", &query.error);
    context.insert("xsrf_token", &xsrf_token);
    let html = tera::Tera::one_off(LOGIN_TEMPLATE, &context, true).map_err(error_500)?;
    Ok(HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(html))
}

#[derive(Deserialize)]
pub struct LoginForm {
    username: String,
    password: Secret<String>,
    #[serde(rename = "_xsrf")]
    xsrf: String,
}

fn invalid_credentials() -> HttpResponse {
    redirect(&format!(
        "/auth/login?error={}",
        urlencoding::encode("Invalid credentials")
    ))
}

/// `POST /auth/login`
///
/// Credentials are checked by the manager (which in turn runs the SRP
/// exchange against the identity provider); the proxy only keeps the signed
/// session cookie.
#[tracing::instrument(name = "Proxy login", skip_all, fields(username = %form.username))]
pub async fn login(
    session: TypedSession,
    form: web::Form<LoginForm>,
    manager: web::Data<ManagerClient>,
) -> Result<HttpResponse, actix_web::Error> {
    match session.xsrf_token().map_err(error_500)? {
        Some(expected) if expected == form.xsrf => {}
        _ => return Err(actix_web::error::ErrorForbidden("XSRF token mismatch")),
    }

    let form = form.into_inner();
    let outcome = async {
        manager.get_agent(&form.username).await?;
        manager.authenticate(&form.username, &form.password).await
    }
    .await;
    match outcome {
        Ok(()) => {
            session.renew();
            session.log_in(&form.username).map_err(error_500)?;
            Ok(redirect("/"))
        }
        Err(ManagerClientError::Http { .. }) | Err(ManagerClientError::Initializing) => {
            tracing::warn!("login rejected");
            Ok(invalid_credentials())
        }
        Err(e) => Err(error_500(e)),
    }
}

/// `GET /auth/logout`
pub async fn logout(session: TypedSession) -> HttpResponse {
    session.log_out();
    HttpResponse::Ok().body("You are now logged out")
}

/// `GET /dispatcher_static/{asset}`
///
/// The proxy's own assets are embedded; the prefix is distinct from the
/// agent's `/static` so the fallthrough route stays unambiguous.
pub async fn static_asset(asset: web::Path<String>) -> HttpResponse {
    match asset.as_str() {
        "dispatcher.css" => HttpResponse::Ok()
            .content_type("text/css; charset=utf-8")
            .body(DISPATCHER_CSS),
        _ => HttpResponse::NotFound().finish(),
    }
}

fn agent_down() -> HttpResponse {
    HttpResponse::ServiceUnavailable().body("Sorry, your agent is down")
}

fn transport_error<E: std::fmt::Display>(e: E) -> HttpResponse {
    HttpResponse::InternalServerError().body(format!("Internal server error:\n{e}"))
}

/// Catch-all: relay the request to the authenticated user's agent.
///
/// Method, URI and body are copied verbatim; request headers pass through;
/// the agent's redirects are relayed, not followed; response headers are
/// filtered to a whitelist. A transport failure (as opposed to an HTTP error
/// from the agent, which is relayed unchanged) becomes a 500 with the error
/// text.
pub async fn forward(
    req: HttpRequest,
    payload: web::Payload,
    session: TypedSession,
    manager: web::Data<ManagerClient>,
    client: web::Data<ForwardClient>,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(user) = session.get_user().map_err(error_500)? else {
        return Ok(redirect("/auth/login"));
    };

    let runtime = match manager.get_agent_runtime(&user).await {
        Ok(runtime) => runtime,
        Err(ManagerClientError::Http { .. }) | Err(ManagerClientError::Initializing) => {
            return Ok(agent_down());
        }
        Err(e) => return Ok(transport_error(e)),
    };
    let port = match (runtime.state, runtime.port) {
        (AgentState::Running, Some(port)) => port,
        _ => return Ok(agent_down()),
    };

    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{port}{uri}");
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(error_500)?;

    let mut upstream = client.0.request(method, url);
    let mut has_body = false;
    for (name, value) in req.headers() {
        let lowered = name.as_str().to_ascii_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            has_body = true;
        }
        if HOP_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }

    if has_body {
        // bridge the (thread-local) actix payload into a sendable stream
        let (mut tx, rx) = futures_channel::mpsc::channel::<
            Result<actix_web::web::Bytes, std::io::Error>,
        >(8);
        let mut payload = payload;
        actix_web::rt::spawn(async move {
            while let Some(chunk) = payload.next().await {
                let item =
                    chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        upstream = upstream.body(reqwest::Body::wrap_stream(rx));
    }

    let response = match tokio::time::timeout(FORWARD_TIMEOUT, upstream.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Ok(transport_error(e)),
        Err(_) => {
            return Ok(transport_error(format!(
                "agent did not answer within {}s",
                FORWARD_TIMEOUT.as_secs()
            )))
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).map_err(error_500)?;
    let mut relayed = HttpResponse::build(status);
    for header in RELAYED_HEADERS {
        if let Some(value) = response.headers().get(header) {
            relayed.insert_header((header, value.as_bytes()));
        }
    }
    Ok(relayed.streaming(response.bytes_stream()))
}
