use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::AttachContainerOptions;
use bollard::container::Config;
use bollard::container::CreateContainerOptions;
use bollard::container::KillContainerOptions;
use bollard::container::ListContainersOptions;
use bollard::container::RemoveContainerOptions;
use bollard::container::StartContainerOptions;
use bollard::container::StatsOptions;
use bollard::container::StopContainerOptions;
use bollard::image::BuildImageOptions;
use bollard::image::CreateImageOptions;
use bollard::image::ListImagesOptions;
use bollard::models::ContainerSummary;
use bollard::models::HostConfig;
use bollard::models::Network;
use bollard::models::PortBinding;
use bollard::network::InspectNetworkOptions;
use bollard::ClientVersion;
use bollard::Docker;
use futures_util::StreamExt;
use futures_util::TryStreamExt;
use secrecy::Secret;

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

/// Engine API version this backend speaks. Pinned so wire-format drift in the
/// local daemon cannot silently break container management; bump it here,
/// deliberately, after testing against the new engine.
pub const DOCKER_API_VERSION: ClientVersion = ClientVersion {
    major_version: 1,
    minor_version: 41,
};

/// Port the agent listens on inside its container.
const AGENT_PORT: u16 = 4567;

/// Where the user's `data/` directory is mounted inside the container.
const DATA_MOUNT: &str = "/mnt/user";

/// Build script for the default agent image (used when the configured image
/// name carries no registry path).
const AGENT_DOCKERFILE: &str = include_str!("Dockerfile.agent");

/// Companion image forwarding container logs to the host syslog.
const LOG_FORWARDER_IMAGE: &str = "pixelated/logspout";
const LOG_FORWARDER_NAME: &str = "pixelated_log_forwarder";

/// Gateway of the engine's default bridge network, used when the network
/// cannot be inspected.
const DEFAULT_BRIDGE_GATEWAY: &str = "172.17.0.1";

/// Backend driving a local container runtime: one container per user, the
/// user's `data/` bind-mounted, a fixed memory limit, and the agent port
/// published on loopback only.
pub struct DockerProvider {
    docker: Docker,
    agent: AgentSettings,
    leap_provider_hostname: String,
    ca_bundle: Option<PathBuf>,
    initializing: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    credentials: Mutex<HashMap<String, Secret<String>>>,
}

impl DockerProvider {
    pub fn new(
        agent: AgentSettings,
        leap_provider_hostname: String,
        ca_bundle: Option<PathBuf>,
    ) -> Result<Self, DispatcherError> {
        let docker = Docker::connect_with_unix(&agent.docker_url, 120, &DOCKER_API_VERSION)
            .with_context(|| format!("failed to connect to docker at {}", agent.docker_url))?;
        Ok(Self {
            docker,
            agent,
            leap_provider_hostname,
            ca_bundle,
            initializing: AtomicBool::new(true),
            init_lock: tokio::sync::Mutex::new(()),
            credentials: Mutex::new(HashMap::new()),
        })
    }

    fn guard_initializing(&self) -> Result<(), DispatcherError> {
        match self.initializing() {
            true => Err(DispatcherError::ProviderInitializing),
            false => Ok(()),
        }
    }

    fn image_tag(&self) -> String {
        format!("{}:latest", self.agent.docker_image)
    }

    async fn image_exists(
        &self,
        tag: &str,
    ) -> Result<bool, DispatcherError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await
            .context("failed to list docker images")?;
        Ok(images
            .iter()
            .any(|image| image.repo_tags.iter().any(|t| t == tag)))
    }

    /// Images with a registry path are pulled; bare names are built from the
    /// embedded build script.
    async fn ensure_image(&self) -> Result<(), DispatcherError> {
        let tag = self.image_tag();
        if self.image_exists(&tag).await? {
            return Ok(());
        }
        if self.agent.docker_image.contains('/') {
            tracing::info!(image = %tag, "pulling agent image");
            self.docker
                .create_image(
                    Some(CreateImageOptions {
                        from_image: self.agent.docker_image.as_str(),
                        tag: "latest",
                        ..Default::default()
                    }),
                    None,
                    None,
                )
                .try_collect::<Vec<_>>()
                .await
                .context("failed to pull agent image")?;
        } else {
            tracing::info!(image = %tag, "building agent image");
            let context = build_context(AGENT_DOCKERFILE).context("failed to build tar context")?;
            self.docker
                .build_image(
                    BuildImageOptions {
                        dockerfile: "Dockerfile",
                        t: tag.as_str(),
                        rm: true,
                        ..Default::default()
                    },
                    None,
                    Some(context.into()),
                )
                .try_collect::<Vec<_>>()
                .await
                .context("failed to build agent image")?;
        }
        Ok(())
    }

    /// Pull and start the syslog forwarder next to the agents.
    async fn ensure_log_forwarder(&self) -> Result<(), DispatcherError> {
        let tag = format!("{LOG_FORWARDER_IMAGE}:latest");
        if !self.image_exists(&tag).await? {
            tracing::info!(image = %tag, "pulling log forwarder image");
            self.docker
                .create_image(
                    Some(CreateImageOptions {
                        from_image: LOG_FORWARDER_IMAGE,
                        tag: "latest",
                        ..Default::default()
                    }),
                    None,
                    None,
                )
                .try_collect::<Vec<_>>()
                .await
                .context("failed to pull log forwarder image")?;
        }
        if self.find_container(LOG_FORWARDER_NAME).await?.is_none() {
            self.docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: LOG_FORWARDER_NAME,
                        platform: None,
                    }),
                    Config {
                        image: Some(tag),
                        cmd: Some(vec![
                            "syslog://localhost:514?append_tag=.user_agent".to_string()
                        ]),
                        env: Some(vec!["HTTP_PORT=51957".to_string()]),
                        host_config: Some(HostConfig {
                            network_mode: Some("host".to_string()),
                            binds: Some(vec!["/var/run/docker.sock:/tmp/docker.sock".to_string()]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await
                .context("failed to create log forwarder container")?;
        }
        match self
            .docker
            .start_container(LOG_FORWARDER_NAME, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already running, fine
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })
            | Ok(()) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context("failed to start log forwarder container")
                .into()),
        }
    }

    async fn find_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, DispatcherError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;
        Ok(containers
            .into_iter()
            .find(|container| container_name_matches(container, name)))
    }

    async fn running_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, DispatcherError> {
        Ok(self
            .find_container(name)
            .await?
            .filter(|container| container.state.as_deref() == Some("running")))
    }

    /// Gateway address of the default bridge network, where the host (and
    /// everything it routes, the identity provider included) answers from
    /// inside a container.
    async fn bridge_gateway(&self) -> String {
        match self
            .docker
            .inspect_network("bridge", None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => match gateway_of(&network) {
                Some(gateway) => gateway,
                None => {
                    tracing::warn!("bridge network reports no gateway, using the default");
                    DEFAULT_BRIDGE_GATEWAY.to_string()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to inspect the bridge network, using the default gateway");
                DEFAULT_BRIDGE_GATEWAY.to_string()
            }
        }
    }

    fn agent_command(&self) -> String {
        let mut command = format!(
            "/usr/bin/pixelated-user-agent --leap-home {DATA_MOUNT} \
             --host 0.0.0.0 --port {AGENT_PORT} --organization-mode"
        );
        if self.ca_bundle.is_some() {
            command.push_str(&format!(" --leap-provider-cert {DATA_MOUNT}/{PROVIDER_CA_FILE}"));
        }
        command
    }

    fn container_config(
        &self,
        user: &UserConfig,
        port: u16,
        extra_hosts: Vec<String>,
    ) -> Config<String> {
        let port_key = format!("{AGENT_PORT}/tcp");
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        Config {
            image: Some(self.image_tag()),
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-l".to_string(),
                "-c".to_string(),
                self.agent_command(),
            ]),
            env: Some(vec![
                "DISPATCHER_LOGOUT_URL=/auth/logout".to_string(),
                format!("FEEDBACK_URL=https://{}/tickets", self.leap_provider_hostname),
            ]),
            exposed_ports: Some(exposed_ports),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            // the agent must run as the uid owning the bind-mounted data
            // directory (created 0700 by the registry), not as whatever uid
            // the image assigns its user
            user: Some(nix::unistd::getuid().to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{DATA_MOUNT}",
                    user.data_path().display()
                )]),
                memory: Some(self.agent.memory_limit_bytes as i64),
                port_bindings: Some(port_bindings),
                extra_hosts: Some(extra_hosts),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Port bindings are fixed at creation in the pinned API, so a leftover
    /// stopped container cannot be rebound and has to go.
    async fn remove_stale_container(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        if self.find_container(name).await?.is_some() {
            self.docker
                .remove_container(
                    name,
                    Some(RemoveContainerOptions {
                        force: false,
                        ..Default::default()
                    }),
                )
                .await
                .with_context(|| format!("failed to remove stale container for {name}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), DispatcherError> {
        let _guard = self.init_lock.lock().await;
        if !self.initializing() {
            return Ok(());
        }
        self.docker
            .ping()
            .await
            .context("docker daemon is not reachable")?;
        self.ensure_image().await?;
        if self.agent.log_forwarder {
            self.ensure_log_forwarder().await?;
        }
        self.initializing.store(false, Ordering::SeqCst);
        tracing::info!(image = %self.image_tag(), "docker provider initialized");
        Ok(())
    }

    async fn start(
        &self,
        user: &UserConfig,
        port: u16,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        if self.running_container(&user.name).await?.is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        stage_provider_ca(user, self.ca_bundle.as_deref())?;
        self.remove_stale_container(&user.name).await?;

        // the provider's endpoints are not resolvable from the container
        // network; pin them (and the dispatcher host itself) to the gateway
        let gateway = self.bridge_gateway().await;
        let extra_hosts = host_aliases(
            &self.leap_provider_hostname,
            host_name().as_deref(),
            &gateway,
        );

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: user.name.as_str(),
                    platform: None,
                }),
                self.container_config(user, port, extra_hosts),
            )
            .await
            .with_context(|| format!("failed to create container for {}", user.name))?;
        self.docker
            .start_container(&user.name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container for {}", user.name))?;

        let staged = self.credentials.lock().unwrap().remove(&user.name);
        if let Some(password) = staged {
            let attached = self
                .docker
                .attach_container(
                    &user.name,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(true),
                        stdout: Some(false),
                        stderr: Some(false),
                        stream: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .with_context(|| format!("failed to attach to container for {}", user.name))?;
            spawn_injector(
                attached.input,
                AgentCredentials {
                    user: user.name.clone(),
                    password,
                    leap_provider_hostname: self.leap_provider_hostname.clone(),
                },
            );
        }
        tracing::info!(agent = %user.name, port, "container started");
        Ok(())
    }

    async fn stop(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        if self.running_container(name).await?.is_none() {
            return Err(DispatcherError::InstanceNotRunning(name.to_string()));
        }
        self.credentials.lock().unwrap().remove(name);
        // the daemon escalates to SIGKILL after the grace period; a transport
        // failure on the way falls back to an explicit kill
        if let Err(e) = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            tracing::warn!(agent = %name, error = %e, "graceful stop failed, killing container");
            self.docker
                .kill_container(name, None::<KillContainerOptions<String>>)
                .await
                .with_context(|| format!("failed to kill container for {name}"))?;
        }
        tracing::info!(agent = %name, "container stopped");
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>, DispatcherError> {
        self.guard_initializing()?;
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .context("failed to list containers")?;
        let mut names: Vec<String> = containers
            .iter()
            .filter_map(primary_name)
            .filter(|name| name != LOG_FORWARDER_NAME)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn status(
        &self,
        name: &str,
    ) -> Result<AgentStatus, DispatcherError> {
        self.guard_initializing()?;
        Ok(match self.running_container(name).await? {
            Some(container) => AgentStatus {
                state: AgentState::Running,
                port: published_port(&container),
            },
            None => AgentStatus::stopped(),
        })
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, DispatcherError> {
        self.guard_initializing()?;
        let mut agents = Vec::new();
        for name in self.list_running().await? {
            let stats = self
                .docker
                .stats(
                    &name,
                    Some(StatsOptions {
                        stream: false,
                        one_shot: true,
                    }),
                )
                .take(1)
                .try_collect::<Vec<_>>()
                .await;
            let memory_usage = match stats {
                Ok(stats) => stats
                    .first()
                    .and_then(|stats| stats.memory_stats.usage)
                    .unwrap_or(0),
                Err(e) => {
                    tracing::warn!(agent = %name, error = %e, "failed to read container stats");
                    0
                }
            };
            agents.push(AgentMemoryUsage { name, memory_usage });
        }
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
        if self.running_container(&user.name).await?.is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        // the container's view of data/ is about to be wiped; drop it
        self.remove_stale_container(&user.name).await
    }

    async fn remove(
        &self,
        user: &UserConfig,
    ) -> Result<(), DispatcherError> {
        self.guard_initializing()?;
        if self.running_container(&user.name).await?.is_some() {
            return Err(DispatcherError::InstanceAlreadyRunning(user.name.clone()));
        }
        self.credentials.lock().unwrap().remove(&user.name);
        self.remove_stale_container(&user.name).await
    }
}

/// `extra_hosts` entries for the agent container: the identity provider's
/// domain, its `api.`/`nicknym.` service subdomains, and the dispatcher
/// host's own name, all answered at `gateway`.
fn host_aliases(
    server_name: &str,
    host_name: Option<&str>,
    gateway: &str,
) -> Vec<String> {
    let mut names = vec![
        server_name.to_string(),
        format!("api.{server_name}"),
        format!("nicknym.{server_name}"),
    ];
    if let Some(host) = host_name {
        if !host.is_empty() && !names.iter().any(|name| name == host) {
            names.push(host.to_string());
        }
    }
    names
        .into_iter()
        .map(|name| format!("{name}:{gateway}"))
        .collect()
}

fn host_name() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
}

fn gateway_of(network: &Network) -> Option<String> {
    network
        .ipam
        .as_ref()?
        .config
        .as_ref()?
        .iter()
        .find_map(|config| config.gateway.clone())
}

/// Container names arrive with a leading slash from the engine.
fn primary_name(container: &ContainerSummary) -> Option<String> {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
}

fn container_name_matches(
    container: &ContainerSummary,
    name: &str,
) -> bool {
    primary_name(container).as_deref() == Some(name)
}

fn published_port(container: &ContainerSummary) -> Option<u16> {
    container.ports.as_ref().and_then(|ports| {
        ports
            .iter()
            .find(|port| port.private_port == AGENT_PORT)
            .and_then(|port| port.public_port)
    })
}

/// Single-file tar archive handed to the engine as the build context.
fn build_context(dockerfile: &str) -> Result<Vec<u8>, anyhow::Error> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, dockerfile.as_bytes())?;
    Ok(builder.into_inner()?)
}
