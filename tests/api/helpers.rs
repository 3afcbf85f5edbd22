use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use pixelated_dispatcher::configuration::AgentSettings;
use pixelated_dispatcher::configuration::Backend;
use pixelated_dispatcher::configuration::LeapSettings;
use pixelated_dispatcher::configuration::ManagerSettings;
use pixelated_dispatcher::configuration::ProxySettings;
use pixelated_dispatcher::manager;
use pixelated_dispatcher::manager_client::ManagerClient;
use pixelated_dispatcher::manager_client::ManagerClientError;
use pixelated_dispatcher::proxy;
use pixelated_dispatcher::telemetry::get_subscriber;
use pixelated_dispatcher::telemetry::init_subscriber;
use pixelated_dispatcher::tls::TlsOptions;
use rand::RngCore;
use secrecy::Secret;
use sha2::Sha256;
use srp::groups::G_1024;
use srp::server::SrpServer;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::path_regex;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::Respond;
use wiremock::ResponseTemplate;

/// Init the subscriber once only. Opt in to verbose logging with
/// `TEST_LOG=true cargo test | bunyan`.
static TRACING: Lazy<()> = Lazy::new(|| match std::env::var("TEST_LOG") {
    Ok(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::stdout);
        init_subscriber(subscriber);
    }
    Err(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::sink);
        init_subscriber(subscriber);
    }
});

/// Registered verifiers plus the per-login state carried between the two SRP
/// rounds.
#[derive(Default)]
struct SrpState {
    users: Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>, // login -> (salt, verifier)
    pending: Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>, // login -> (b, A)
}

/// Identity-provider double: speaks the registration and two-round login
/// endpoints using the server half of the same SRP implementation.
pub struct SrpProviderMock {
    pub server: MockServer,
    state: Arc<SrpState>,
}

struct RegisterResponder(Arc<SrpState>);

impl Respond for RegisterResponder {
    fn respond(
        &self,
        request: &Request,
    ) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let login = body["login"].as_str().unwrap().to_string();
        let salt = hex::decode(body["password_salt"].as_str().unwrap()).unwrap();
        let verifier = hex::decode(body["password_verifier"].as_str().unwrap()).unwrap();

        let mut users = self.0.users.lock().unwrap();
        if users.contains_key(&login) {
            return ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "errors": { "login": ["has already been taken"] },
            }));
        }
        users.insert(login.clone(), (salt, verifier));
        ResponseTemplate::new(201)
            .set_body_json(serde_json::json!({ "login": login, "ok": true }))
    }
}

struct HandshakeResponder(Arc<SrpState>);

impl Respond for HandshakeResponder {
    fn respond(
        &self,
        request: &Request,
    ) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let login = body["login"].as_str().unwrap().to_string();
        let a_pub = hex::decode(body["A"].as_str().unwrap()).unwrap();

        let users = self.0.users.lock().unwrap();
        let Some((salt, verifier)) = users.get(&login) else {
            return ResponseTemplate::new(404);
        };
        let mut b = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut b);
        let server = SrpServer::<Sha256>::new(&G_1024);
        let b_pub = server.compute_public_ephemeral(&b, verifier);
        self.0
            .pending
            .lock()
            .unwrap()
            .insert(login, (b.to_vec(), a_pub));
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "salt": hex::encode(salt),
            "B": hex::encode(b_pub),
        }))
    }
}

struct ProofResponder(Arc<SrpState>);

impl Respond for ProofResponder {
    fn respond(
        &self,
        request: &Request,
    ) -> ResponseTemplate {
        let login = request
            .url
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap()
            .to_string();
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let m1 = hex::decode(body["client_auth"].as_str().unwrap()).unwrap();

        let Some((b, a_pub)) = self.0.pending.lock().unwrap().remove(&login) else {
            return ResponseTemplate::new(404);
        };
        let users = self.0.users.lock().unwrap();
        let Some((_salt, verifier)) = users.get(&login) else {
            return ResponseTemplate::new(404);
        };
        let server = SrpServer::<Sha256>::new(&G_1024);
        let Ok(session) = server.process_reply(&b, verifier, &a_pub) else {
            return ResponseTemplate::new(404);
        };
        if session.verify_client(&m1).is_err() {
            return ResponseTemplate::new(404);
        }
        ResponseTemplate::new(200)
            .insert_header("Set-Cookie", "_session_id=some_session_id;")
            .set_body_json(serde_json::json!({
                "M2": hex::encode(session.proof()),
                "id": "some id",
                "token": "some token",
            }))
    }
}

impl SrpProviderMock {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(SrpState::default());
        Mock::given(method("POST"))
            .and(path("/1/users"))
            .respond_with(RegisterResponder(Arc::clone(&state)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1/sessions"))
            .respond_with(HandshakeResponder(Arc::clone(&state)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex("^/1/sessions/.+$"))
            .respond_with(ProofResponder(Arc::clone(&state)))
            .mount(&server)
            .await;
        Self { server, state }
    }

    pub fn registered_users(&self) -> Vec<String> {
        self.state.users.lock().unwrap().keys().cloned().collect()
    }
}

/// Stand-in agent binary: records arguments and stdin under its data
/// directory, then idles until stopped.
const RECORDING_AGENT: &str = r#"home="$2"
printf '%s ' "$@" > "$home/args"
cat > "$home/stdin"
sleep 30"#;

pub struct ManagerOptions {
    pub port_range: (u16, u16),
    pub agent_body: &'static str,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            port_range: (5000, 15000),
            agent_body: RECORDING_AGENT,
        }
    }
}

pub struct TestManager {
    pub addr: String,
    pub root: TempDir,
    pub srp: SrpProviderMock,
    /// The typed client the proxy and CLI use; most assertions go through it.
    pub client: ManagerClient,
    /// Raw client for status-code and body-shape assertions.
    pub api: reqwest::Client,
}

impl TestManager {
    pub async fn add(
        &self,
        name: &str,
        password: &str,
    ) {
        self.client
            .add(name, &Secret::new(password.to_string()))
            .await
            .unwrap();
    }

    pub fn data_path(
        &self,
        name: &str,
    ) -> std::path::PathBuf {
        self.root.path().join(name).join("data")
    }
}

pub async fn spawn_manager() -> TestManager {
    spawn_manager_with(ManagerOptions::default()).await
}

pub async fn spawn_manager_with(options: ManagerOptions) -> TestManager {
    Lazy::force(&TRACING);

    let srp = SrpProviderMock::start().await;
    let root = tempfile::tempdir().unwrap();
    let agent_bin = root.path().join("fake-agent.sh");
    fs::write(&agent_bin, format!("#!/bin/sh\n{}\n", options.agent_body)).unwrap();
    fs::set_permissions(&agent_bin, fs::Permissions::from_mode(0o755)).unwrap();

    let cfg = ManagerSettings {
        root_path: root.path().to_path_buf(),
        backend: Backend::Fork,
        bind: "127.0.0.1:0".to_string(),
        tls: None,
        leap: LeapSettings {
            server_name: "example.org".to_string(),
            ca_bundle: None,
            fingerprint: None,
            api_uri: Some(srp.server.uri()),
        },
        agent: AgentSettings {
            bin: agent_bin.to_string_lossy().into_owned(),
            min_free_memory_bytes: 0,
            ..AgentSettings::default()
        },
        port_range: options.port_range,
    };
    let app = manager::startup::Application::build(cfg).await.unwrap();
    let addr = format!("http://127.0.0.1:{}", app.get_port());
    tokio::spawn(app.run_until_stopped());

    let client = ManagerClient::new(addr.clone(), &TlsOptions::default()).unwrap();
    // provider initialization is a background task; wait for it to finish
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match client.list().await {
            Ok(_) => break,
            Err(ManagerClientError::Initializing) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("manager did not come up: {e}"),
        }
    }

    TestManager {
        addr,
        root,
        srp,
        client,
        api: reqwest::Client::new(),
    }
}

pub struct TestProxy {
    pub addr: String,
    /// wiremock double of the manager API.
    pub manager: MockServer,
    /// Browser stand-in: cookie jar on, redirects not followed.
    pub api: reqwest::Client,
}

pub async fn spawn_proxy() -> TestProxy {
    Lazy::force(&TRACING);

    let manager = MockServer::start().await;
    // the proxy validates its manager connection at startup
    Mock::given(method("GET"))
        .and(path("/agents"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "agents": [] })),
        )
        .mount(&manager)
        .await;

    let cfg = ProxySettings {
        manager: "unused:0".to_string(),
        bind: "127.0.0.1:0".to_string(),
        tls: None,
        fingerprint: None,
        verify_hostname: None,
        banner: None,
    };
    let client = ManagerClient::new(manager.uri(), &TlsOptions::default()).unwrap();
    let app = proxy::startup::Application::build_with_client(cfg, client)
        .await
        .unwrap();
    let addr = format!("http://127.0.0.1:{}", app.get_port());
    tokio::spawn(app.run_until_stopped());

    let api = reqwest::Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestProxy { addr, manager, api }
}

impl TestProxy {
    pub async fn get_login_html(&self) -> String {
        self.api
            .get(format!("{}/auth/login", self.addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }

    /// Full browser-shaped login: fetch the form, echo the xsrf token back.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> reqwest::Response {
        let html = self.get_login_html().await;
        let token = extract_xsrf(&html);
        self.api
            .post(format!("{}/auth/login", self.addr))
            .form(&[
                ("username", username),
                ("password", password),
                ("_xsrf", &token),
            ])
            .send()
            .await
            .unwrap()
    }
}

pub fn extract_xsrf(html: &str) -> String {
    let marker = r#"name="_xsrf" value=""#;
    let start = html.find(marker).expect("login form carries no xsrf token") + marker.len();
    let end = html[start..].find('"').unwrap() + start;
    html[start..end].to_string()
}

pub fn check_redirect(
    response: &reqwest::Response,
    location: &str,
) {
    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(
        response.headers().get("Location").unwrap().to_str().unwrap(),
        location
    );
}
