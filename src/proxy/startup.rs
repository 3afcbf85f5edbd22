use std::fs;
use std::net::TcpListener;

use actix_session::config::PersistentSession;
use actix_session::storage::CookieSessionStore;
use actix_session::SessionMiddleware;
use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::Key;
use actix_web::dev::Server;
use actix_web::web;
use actix_web::App;
use actix_web::HttpServer;
use anyhow::Context;
use rand::RngCore;
use tracing_actix_web::TracingLogger;

use crate::configuration::ProxySettings;
use crate::configuration::ServerTlsSettings;
use crate::manager_client::ManagerClient;
use crate::proxy::routes;
use crate::tls::server_config;

/// Name of the signed session cookie carrying the authenticated login.
pub const SESSION_COOKIE: &str = "pixelated_user";

/// Wrapper for the optional login-screen HTML fragment (raw `String`s clash
/// when shared via `Data`).
pub struct Banner(pub String);

/// reqwest client used only for forwarding to local agents: plain HTTP on
/// loopback, redirects relayed instead of followed.
pub struct ForwardClient(pub reqwest::Client);

pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: ProxySettings) -> Result<Self, anyhow::Error> {
        let (host, port) = cfg
            .manager
            .split_once(':')
            .with_context(|| format!("manager must be host:port, got {:?}", cfg.manager))?;
        let manager = ManagerClient::for_endpoint(
            host,
            port.parse::<u16>()
                .with_context(|| format!("invalid manager port in {:?}", cfg.manager))?,
            true,
            &cfg.manager_tls_options(),
        )?;
        Self::build_with_client(cfg, manager).await
    }

    /// Split out so tests can aim the proxy at a plain-HTTP manager double.
    pub async fn build_with_client(
        cfg: ProxySettings,
        manager: ManagerClient,
    ) -> Result<Self, anyhow::Error> {
        // refuse to come up against a dead manager; an initializing one is fine
        manager
            .validate_connection(std::time::Duration::from_secs(10))
            .await
            .context("manager is not reachable")?;

        let banner = match &cfg.banner {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("failed to read banner file {}", path.display()))?,
            None => String::new(),
        };

        let listener = TcpListener::bind(&cfg.bind)
            .with_context(|| format!("failed to bind {}", cfg.bind))?;
        let port = listener.local_addr()?.port();
        let server = run(listener, manager, banner, cfg.tls.clone())?;
        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

/// Declares the proxy's routes. Everything that is not login, logout or a
/// static asset falls through to the forwarder.
pub fn run(
    listener: TcpListener,
    manager: ManagerClient,
    banner: String,
    tls: Option<ServerTlsSettings>,
) -> Result<Server, anyhow::Error> {
    // sessions are deliberately not valid across proxy restarts
    let mut key_bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = Key::from(&key_bytes);

    // the Secure cookie attribute requires a TLS deployment; without one the
    // cookie would never come back over plain HTTP
    let secure_cookies = tls.is_some();

    let forward_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build forwarding client")?;

    let manager = web::Data::new(manager);
    let banner = web::Data::new(Banner(banner));
    let forward_client = web::Data::new(ForwardClient(forward_client));

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), key.clone())
                    .cookie_name(SESSION_COOKIE.to_string())
                    .cookie_secure(secure_cookies)
                    .cookie_http_only(true)
                    .session_lifecycle(
                        PersistentSession::default().session_ttl(CookieDuration::days(1)),
                    )
                    .build(),
            )
            .route("/auth/login", web::get().to(routes::login_form))
            .route("/auth/login", web::post().to(routes::login))
            .route("/auth/logout", web::get().to(routes::logout))
            .route(
                "/dispatcher_static/{asset:.*}",
                web::get().to(routes::static_asset),
            )
            // explicit fallthrough: every other path belongs to the agent
            .default_service(web::route().to(routes::forward))
            .app_data(manager.clone())
            .app_data(banner.clone())
            .app_data(forward_client.clone())
    });
    let server = match tls {
        Some(tls) => {
            let config = server_config(&tls)?;
            server.listen_rustls_0_23(listener, config)?
        }
        None => server.listen(listener)?,
    }
    .run();
    Ok(server)
}
