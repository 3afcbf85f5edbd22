use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::App;
use actix_web::HttpServer;
use anyhow::Context;
use tracing_actix_web::TracingLogger;

use crate::configuration::Backend;
use crate::configuration::ManagerSettings;
use crate::configuration::ServerTlsSettings;
use crate::leap::certs::which_bundle;
use crate::leap::srp::SrpAuthenticator;
use crate::manager::routes;
use crate::manager::supervisor::LifecycleSupervisor;
use crate::ports::PortPool;
use crate::provider::docker::DockerProvider;
use crate::provider::fork::ForkProvider;
use crate::provider::Provider;
use crate::tls::server_config;
use crate::users::UserRegistry;

/// Shared state behind the manager's REST surface.
pub struct ManagerState {
    pub supervisor: LifecycleSupervisor,
    pub users: UserRegistry,
    pub srp: SrpAuthenticator,
}

/// Wrapper for actix's `Server` with access to the bound port (the listener
/// may be bound to port 0 in tests).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: ManagerSettings) -> Result<Self, anyhow::Error> {
        if !cfg.root_path.is_dir() {
            anyhow::bail!("root path {} not found", cfg.root_path.display());
        }

        let ca_bundle = which_bundle(
            &cfg.leap.server_name,
            &cfg.root_path,
            cfg.leap.ca_bundle.clone(),
        );
        let provider: Arc<dyn Provider> = match cfg.backend {
            Backend::Fork => Arc::new(ForkProvider::new(
                cfg.agent.clone(),
                cfg.leap.server_name.clone(),
                ca_bundle.clone(),
            )),
            Backend::Docker => Arc::new(
                DockerProvider::new(
                    cfg.agent.clone(),
                    cfg.leap.server_name.clone(),
                    ca_bundle.clone(),
                )
                .context("failed to set up the docker backend")?,
            ),
        };

        // image build/pull may take minutes; the API serves 503 meanwhile
        let init = Arc::clone(&provider);
        tokio::spawn(async move {
            if let Err(e) = init.initialize().await {
                tracing::error!(error.cause_chain = ?e, "provider initialization failed");
            }
        });

        let users = UserRegistry::new(&cfg.root_path);
        let supervisor = LifecycleSupervisor::new(
            provider,
            PortPool::new(cfg.port_range.0, cfg.port_range.1),
            users.clone(),
        );
        let mut leap_tls = cfg.leap.tls_options();
        leap_tls.ca_bundle = ca_bundle;
        let srp = SrpAuthenticator::new(cfg.leap.api_uri(), &leap_tls)
            .context("failed to build the SRP authenticator")?;

        let listener = TcpListener::bind(&cfg.bind)
            .with_context(|| format!("failed to bind {}", cfg.bind))?;
        let port = listener.local_addr()?.port();
        let server = run(
            listener,
            ManagerState {
                supervisor,
                users,
                srp,
            },
            cfg.tls.clone(),
        )?;

        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Consumes `self`; either the final call or the argument to
    /// `tokio::spawn`.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

/// Declares the REST surface and hands the listener to actix.
pub fn run(
    listener: TcpListener,
    state: ManagerState,
    tls: Option<ServerTlsSettings>,
) -> Result<Server, anyhow::Error> {
    let state = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/agents", web::get().to(routes::list_agents))
            .route("/agents", web::post().to(routes::add_agent))
            .route("/agents/{name}", web::get().to(routes::get_agent))
            .route("/agents/{name}/runtime", web::get().to(routes::agent_runtime))
            .route("/agents/{name}/state", web::put().to(routes::put_agent_state))
            .route(
                "/agents/{name}/reset_data",
                web::put().to(routes::reset_agent_data),
            )
            .route(
                "/agents/{name}/authenticate",
                web::post().to(routes::authenticate_agent),
            )
            .route("/stats/memory_usage", web::get().to(routes::memory_usage))
            .app_data(state.clone())
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
