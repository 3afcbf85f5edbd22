use std::path::PathBuf;

use crate::tls::TlsOptions;

/// Bounds of the agent port pool, inclusive.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (5000, 15000);

/// Which isolation mechanism supervises the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Fork,
    Docker,
}

/// Certificate/key pair for a TLS-terminated listener. Absent means plain
/// HTTP, which is only sensible on loopback (and in tests).
#[derive(Debug, Clone)]
pub struct ServerTlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Identity-provider coordinates, immutable for the lifetime of one manager
/// process.
#[derive(Debug, Clone)]
pub struct LeapSettings {
    /// Domain of the provider, e.g. `example.org`. Agents learn it via the
    /// credential hand-off; the SRP authenticator derives the API URL from it.
    pub server_name: String,
    /// CA bundle validating connections to the provider. `None` means
    /// auto-detection (a local `<server_name>.ca.crt` next to the root path,
    /// falling back to the system roots).
    pub ca_bundle: Option<PathBuf>,
    /// SHA-256 fingerprint pin for the provider's leaf certificate. Takes
    /// precedence over the CA bundle.
    pub fingerprint: Option<String>,
    /// Explicit API endpoint for providers deployed off the standard
    /// `api.<domain>:4430` convention.
    pub api_uri: Option<String>,
}

impl LeapSettings {
    /// LEAP serves its REST API on a dedicated subdomain and port.
    pub fn api_uri(&self) -> String {
        match &self.api_uri {
            Some(uri) => uri.clone(),
            None => format!("https://api.{}:4430", self.server_name),
        }
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            ca_bundle: self.ca_bundle.clone(),
            assert_hostname: None,
            assert_fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Knobs describing the supervised agent processes themselves.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Agent executable launched by the fork backend.
    pub bin: String,
    /// Container image used by the docker backend. A name without `/` is
    /// built locally from the embedded build script, otherwise it is pulled.
    pub docker_image: String,
    /// Engine socket URL for the docker backend.
    pub docker_url: String,
    /// Hard memory limit per agent container.
    pub memory_limit_bytes: u64,
    /// Free-memory floor below which the fork backend refuses to start
    /// further agents.
    pub min_free_memory_bytes: u64,
    /// Run the syslog log-forwarder companion container.
    pub log_forwarder: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bin: "pixelated-user-agent".to_string(),
            docker_image: "pixelated".to_string(),
            docker_url: "unix:///var/run/docker.sock".to_string(),
            memory_limit_bytes: 300 * 1024 * 1024,
            min_free_memory_bytes: 150 * 1024 * 1024,
            log_forwarder: false,
        }
    }
}

/// Everything the manager needs to run; assembled from CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub root_path: PathBuf,
    pub backend: Backend,
    /// `host:port` to listen on.
    pub bind: String,
    pub tls: Option<ServerTlsSettings>,
    pub leap: LeapSettings,
    pub agent: AgentSettings,
    pub port_range: (u16, u16),
}

/// Everything the proxy needs to run.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// `host:port` of the manager.
    pub manager: String,
    pub bind: String,
    pub tls: Option<ServerTlsSettings>,
    /// Pin for the manager's certificate; dominates hostname verification.
    pub fingerprint: Option<String>,
    /// `Some(false)` disables hostname verification against the manager.
    pub verify_hostname: Option<bool>,
    /// Optional HTML fragment shown on the login screen.
    pub banner: Option<PathBuf>,
}

impl ProxySettings {
    pub fn manager_tls_options(&self) -> TlsOptions {
        TlsOptions {
            // when no pin is given, the proxy trusts its own serving cert for
            // the manager connection (both ends are usually deployed with the
            // same certificate on one host)
            ca_bundle: match self.fingerprint {
                None => self.tls.as_ref().map(|tls| tls.cert.clone()),
                Some(_) => None,
            },
            assert_hostname: self.verify_hostname,
            assert_fingerprint: self.fingerprint.clone(),
        }
    }
}
