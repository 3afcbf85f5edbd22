use std::io::BufRead;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use nix::sys::termios;
use nix::sys::termios::LocalFlags;
use nix::sys::termios::SetArg;
use secrecy::Secret;

use crate::configuration::AgentSettings;
use crate::configuration::Backend;
use crate::configuration::LeapSettings;
use crate::configuration::ManagerSettings;
use crate::configuration::ProxySettings;
use crate::configuration::ServerTlsSettings;
use crate::configuration::DEFAULT_PORT_RANGE;
use crate::manager_client::ManagerClient;
use crate::provider::AgentState;
use crate::tls::TlsOptions;

#[derive(Parser)]
#[command(
    name = "pixelated-dispatcher",
    about = "Runs one isolated email agent per user and dispatches traffic to it"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the internal control-plane manager
    Manager(ManagerArgs),
    /// Run the public HTTPS proxy
    Proxy(ProxyArgs),
    #[command(flatten)]
    Client(ClientCommand),
}

/// Inclusive port range, written as `lo-hi`.
#[derive(Debug, Clone, Copy)]
pub struct PortRange(pub u16, pub u16);

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| format!("expected lo-hi, got {s:?}"))?;
        let lo: u16 = lo.parse().map_err(|_| format!("invalid port {lo:?}"))?;
        let hi: u16 = hi.parse().map_err(|_| format!("invalid port {hi:?}"))?;
        if lo > hi {
            return Err(format!("empty port range {s:?}"));
        }
        Ok(Self(lo, hi))
    }
}

#[derive(Args)]
pub struct ManagerArgs {
    /// Root directory holding the per-user data directories
    #[arg(short = 'r', long = "root-path")]
    pub root_path: PathBuf,
    /// Isolation backend supervising the agents
    #[arg(short = 'b', long, value_enum, default_value = "fork")]
    pub backend: Backend,
    /// Interface and port to bind
    #[arg(long, default_value = "127.0.0.1:4449")]
    pub bind: String,
    /// TLS certificate for the control API
    #[arg(long)]
    pub sslcert: Option<PathBuf>,
    /// TLS key for the control API
    #[arg(long)]
    pub sslkey: Option<PathBuf>,
    /// Domain of the LEAP provider the agents connect to
    #[arg(long = "leap-provider", default_value = "localhost")]
    pub leap_provider: String,
    /// CA bundle validating provider connections (auto-detected when absent)
    #[arg(long = "leap-provider-ca")]
    pub leap_provider_ca: Option<PathBuf>,
    /// Pin the provider certificate to this SHA-256 fingerprint
    #[arg(long = "leap-provider-fingerprint")]
    pub leap_provider_fingerprint: Option<String>,
    /// Agent executable (fork backend)
    #[arg(long = "agent-bin", default_value = "pixelated-user-agent")]
    pub agent_bin: String,
    /// Agent image (docker backend); names without `/` are built locally
    #[arg(long = "docker-image", default_value = "pixelated")]
    pub docker_image: String,
    /// Engine socket (docker backend)
    #[arg(long = "docker-url", default_value = "unix:///var/run/docker.sock")]
    pub docker_url: String,
    /// Port pool handed out to agents
    #[arg(long = "port-range")]
    pub port_range: Option<PortRange>,
    /// Run the syslog log-forwarder container next to the agents
    #[arg(long = "log-forwarder")]
    pub log_forwarder: bool,
}

fn tls_pair(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<Option<ServerTlsSettings>, anyhow::Error> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(ServerTlsSettings { cert, key })),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--sslcert and --sslkey must be given together"),
    }
}

impl ManagerArgs {
    pub fn into_settings(self) -> Result<ManagerSettings, anyhow::Error> {
        let tls = tls_pair(self.sslcert, self.sslkey)?;
        // an explicit fingerprint pin supersedes CA validation; the literal
        // value `auto` selects the same detection as leaving the flag off
        let ca_bundle = match self.leap_provider_fingerprint {
            Some(_) => None,
            None => self
                .leap_provider_ca
                .filter(|path| path.as_os_str() != "auto"),
        };
        let port_range = self
            .port_range
            .map(|range| (range.0, range.1))
            .unwrap_or(DEFAULT_PORT_RANGE);
        Ok(ManagerSettings {
            root_path: self.root_path,
            backend: self.backend,
            bind: self.bind,
            tls,
            leap: LeapSettings {
                server_name: self.leap_provider,
                ca_bundle,
                fingerprint: self.leap_provider_fingerprint,
                api_uri: None,
            },
            agent: AgentSettings {
                bin: self.agent_bin,
                docker_image: self.docker_image,
                docker_url: self.docker_url,
                log_forwarder: self.log_forwarder,
                ..AgentSettings::default()
            },
            port_range,
        })
    }
}

#[derive(Args)]
pub struct ProxyArgs {
    /// hostname:port of the manager
    #[arg(short = 'm', long)]
    pub manager: String,
    /// Interface and port to bind
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: String,
    /// TLS certificate presented to browsers
    #[arg(long)]
    pub sslcert: Option<PathBuf>,
    /// TLS key presented to browsers
    #[arg(long)]
    pub sslkey: Option<PathBuf>,
    /// Pin the manager certificate to this SHA-256 fingerprint
    #[arg(long)]
    pub fingerprint: Option<String>,
    /// Skip hostname verification against the manager
    #[arg(long = "disable-verifyhostname")]
    pub disable_verifyhostname: bool,
    /// HTML fragment shown on the login screen
    #[arg(long)]
    pub banner: Option<PathBuf>,
}

impl ProxyArgs {
    pub fn into_settings(self) -> Result<ProxySettings, anyhow::Error> {
        let tls = tls_pair(self.sslcert, self.sslkey)?;
        Ok(ProxySettings {
            manager: self.manager,
            bind: self.bind,
            tls,
            fingerprint: self.fingerprint,
            verify_hostname: match self.disable_verifyhostname {
                true => Some(false),
                false => None,
            },
            banner: self.banner,
        })
    }
}

#[derive(Args, Clone)]
pub struct ClientArgs {
    /// Manager endpoint
    #[arg(long, default_value = "localhost:4449")]
    pub server: String,
    /// Don't validate the manager's TLS certificate
    #[arg(short = 'k', long = "no-check-certificate")]
    pub no_check_certificate: bool,
    /// Force an unsecured connection
    #[arg(long = "no-ssl")]
    pub no_ssl: bool,
}

#[derive(Subcommand)]
pub enum ClientCommand {
    /// List known agents
    List(ClientArgs),
    /// List running agents
    Running(ClientArgs),
    /// Add an agent (prompts for the password)
    Add {
        /// Name of the new user
        name: String,
        #[command(flatten)]
        connection: ClientArgs,
    },
    /// Start an agent
    Start {
        name: String,
        #[command(flatten)]
        connection: ClientArgs,
    },
    /// Stop an agent
    Stop {
        name: String,
        #[command(flatten)]
        connection: ClientArgs,
    },
    /// Show agent runtime info
    Info {
        name: String,
        #[command(flatten)]
        connection: ClientArgs,
    },
    /// Show memory usage across agents
    #[command(name = "memory_usage")]
    MemoryUsage(ClientArgs),
}

impl ClientCommand {
    fn connection(&self) -> &ClientArgs {
        match self {
            Self::List(connection) | Self::Running(connection) | Self::MemoryUsage(connection) => {
                connection
            }
            Self::Add { connection, .. }
            | Self::Start { connection, .. }
            | Self::Stop { connection, .. }
            | Self::Info { connection, .. } => connection,
        }
    }
}

fn client_for(args: &ClientArgs) -> Result<ManagerClient, anyhow::Error> {
    let (host, port) = args
        .server
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("--server must be host:port, got {:?}", args.server))?;
    let tls = TlsOptions {
        assert_hostname: match args.no_check_certificate {
            true => Some(false),
            false => None,
        },
        ..TlsOptions::default()
    };
    ManagerClient::for_endpoint(host, port.parse()?, !args.no_ssl, &tls)
}

/// Prompt on the controlling terminal with echo disabled; falls back to a
/// plain read when stdin is not a tty (pipes, tests).
fn prompt_password(prompt: &str) -> Result<Secret<String>, anyhow::Error> {
    let stdin = std::io::stdin();
    eprint!("{prompt}: ");
    std::io::stderr().flush()?;

    let saved = termios::tcgetattr(&stdin).ok();
    if let Some(saved) = &saved {
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &silent)?;
    }
    let mut password = String::new();
    let read = stdin.lock().read_line(&mut password);
    if let Some(saved) = &saved {
        termios::tcsetattr(&stdin, SetArg::TCSANOW, saved)?;
        eprintln!();
    }
    read?;
    Ok(Secret::new(password.trim_end_matches('\n').to_string()))
}

/// Run one admin command; errors print `<code>: <reason>` to stderr and the
/// process exits 1.
pub async fn run_client(command: ClientCommand) -> i32 {
    match try_run(command).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn try_run(command: ClientCommand) -> Result<(), anyhow::Error> {
    let client = client_for(command.connection())?;
    match command {
        ClientCommand::List(_) => {
            for agent in client.list().await? {
                println!("{}", agent.name);
            }
        }
        ClientCommand::Running(_) => {
            for agent in client.list().await? {
                if agent.state == AgentState::Running {
                    println!("{}", agent.name);
                }
            }
        }
        ClientCommand::Add { name, .. } => {
            let password = prompt_password("Enter password for new user")?;
            client.add(&name, &password).await?;
        }
        ClientCommand::Start { name, .. } => {
            client.start(&name).await?;
        }
        ClientCommand::Stop { name, .. } => {
            client.stop(&name).await?;
        }
        ClientCommand::Info { name, .. } => {
            let runtime = client.get_agent_runtime(&name).await?;
            match runtime.port {
                Some(port) => println!("port:\t{port}"),
                None => println!("port:\t-"),
            }
        }
        ClientCommand::MemoryUsage(_) => {
            let usage = client.memory_usage().await?;
            println!("memory usage:\t{}", usage.total_usage);
            println!("average usage:\t{}\n", usage.average_usage);
            for agent in usage.agents {
                println!("\t{}:\t{}", agent.name, agent.memory_usage);
            }
        }
    }
    Ok(())
}
