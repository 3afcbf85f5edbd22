use wiremock::matchers::body_string;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::helpers::check_redirect;
use crate::helpers::spawn_proxy;
use crate::helpers::TestProxy;

async fn mount_login_mocks(proxy: &TestProxy) {
    Mock::given(method("GET"))
        .and(path("/agents/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "alice", "state": "stopped",
        })))
        .mount(&proxy.manager)
        .await;
    Mock::given(method("POST"))
        .and(path("/agents/alice/authenticate"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&proxy.manager)
        .await;
}

/// Point the manager double's runtime answer for alice at `port`.
async fn mount_runtime(
    proxy: &TestProxy,
    state: &str,
    port: Option<u16>,
) {
    let mut body = serde_json::json!({ "state": state });
    if let Some(port) = port {
        body["port"] = serde_json::json!(port);
    }
    Mock::given(method("GET"))
        .and(path("/agents/alice/runtime"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&proxy.manager)
        .await;
}

#[tokio::test]
async fn login_page_renders_with_error_message() {
    let proxy = spawn_proxy().await;

    let html = proxy
        .api
        .get(format!("{}/auth/login?error=Invalid%20credentials", proxy.addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(html.contains("Invalid credentials"));
    assert!(html.contains(r#"name="_xsrf""#));
}

#[tokio::test]
async fn successful_login_sets_the_session_cookie() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let response = proxy.login("alice", "password").await;
    check_redirect(&response, "/");

    let cookies: Vec<_> = response
        .headers()
        .get_all("Set-Cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("pixelated_user=")));
}

#[tokio::test]
async fn rejected_login_redirects_with_an_error() {
    let proxy = spawn_proxy().await;
    Mock::given(method("GET"))
        .and(path("/agents/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "alice", "state": "stopped",
        })))
        .mount(&proxy.manager)
        .await;
    Mock::given(method("POST"))
        .and(path("/agents/alice/authenticate"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&proxy.manager)
        .await;

    let response = proxy.login("alice", "wrong").await;
    check_redirect(&response, "/auth/login?error=Invalid%20credentials");
}

#[tokio::test]
async fn login_without_the_xsrf_token_is_forbidden() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let response = proxy
        .api
        .post(format!("{}/auth/login", proxy.addr))
        .form(&[
            ("username", "alice"),
            ("password", "password"),
            ("_xsrf", "forged"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn anonymous_requests_are_sent_to_the_login_page() {
    let proxy = spawn_proxy().await;

    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .send()
        .await
        .unwrap();
    check_redirect(&response, "/auth/login");
}

#[tokio::test]
async fn requests_are_forwarded_with_filtered_response_headers() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let agent = MockServer::start().await;
    let agent_port = agent.address().port();
    mount_runtime(&proxy, "running", Some(agent_port)).await;
    Mock::given(method("GET"))
        .and(path("/inbox"))
        .and(header("X-Requested-With", "XMLHttpRequest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/json")
                .insert_header("Server", "agent")
                .insert_header("X-Agent-Internal", "secret")
                .insert_header("Set-Cookie", "agent_session=leaked")
                .set_body_string(r#"{"mails":[]}"#),
        )
        .mount(&agent)
        .await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .header("X-Requested-With", "XMLHttpRequest")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "application/json"
    );
    assert_eq!(response.headers().get("Server").unwrap(), "agent");
    // only whitelisted headers survive; agent cookies never reach the browser
    assert!(response.headers().get("X-Agent-Internal").is_none());
    assert!(response.headers().get("Set-Cookie").is_none());
    assert_eq!(response.text().await.unwrap(), r#"{"mails":[]}"#);
}

#[tokio::test]
async fn request_bodies_reach_the_agent_verbatim() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let agent = MockServer::start().await;
    mount_runtime(&proxy, "running", Some(agent.address().port())).await;
    Mock::given(method("POST"))
        .and(path("/mails"))
        .and(body_string(r#"{"subject":"hi"}"#))
        .respond_with(ResponseTemplate::new(201))
        .mount(&agent)
        .await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .post(format!("{}/mails", proxy.addr))
        .header("Content-Type", "application/json")
        .body(r#"{"subject":"hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn agent_redirects_are_relayed_not_followed() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let agent = MockServer::start().await;
    mount_runtime(&proxy, "running", Some(agent.address().port())).await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "/new"),
        )
        .mount(&agent)
        .await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/old", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(response.headers().get("Location").unwrap(), "/new");
}

#[tokio::test]
async fn agent_http_errors_are_relayed_unchanged() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;

    let agent = MockServer::start().await;
    mount_runtime(&proxy, "running", Some(agent.address().port())).await;
    Mock::given(method("GET"))
        .and(path("/inbox"))
        .respond_with(ResponseTemplate::new(418))
        .mount(&agent)
        .await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 418);
}

#[tokio::test]
async fn stopped_agent_yields_the_down_page() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;
    mount_runtime(&proxy, "stopped", None).await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(response.text().await.unwrap(), "Sorry, your agent is down");
}

#[tokio::test]
async fn unreachable_agent_becomes_a_transport_error() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;
    // nothing listens on this port
    mount_runtime(&proxy, "running", Some(1)).await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("Internal server error:"));
}

#[tokio::test]
async fn logout_clears_the_session() {
    let proxy = spawn_proxy().await;
    mount_login_mocks(&proxy).await;
    mount_runtime(&proxy, "running", Some(1)).await;

    proxy.login("alice", "password").await;
    let response = proxy
        .api
        .get(format!("{}/auth/logout", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "You are now logged out");

    // back to anonymous: the catch-all demands a login again
    let response = proxy
        .api
        .get(format!("{}/inbox", proxy.addr))
        .send()
        .await
        .unwrap();
    check_redirect(&response, "/auth/login");
}

#[tokio::test]
async fn static_assets_are_served_from_the_embedded_root() {
    let proxy = spawn_proxy().await;

    let response = proxy
        .api
        .get(format!("{}/dispatcher_static/dispatcher.css", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.unwrap().contains(".login-box"));

    let response = proxy
        .api
        .get(format!("{}/dispatcher_static/nope.js", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}
