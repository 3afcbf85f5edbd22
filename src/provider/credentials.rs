use secrecy::ExposeSecret;
use secrecy::Secret;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// What a freshly started agent reads from its stdin: exactly one JSON line,
/// after which the stream is closed.
pub struct AgentCredentials {
    pub user: String,
    pub password: Secret<String>,
    pub leap_provider_hostname: String,
}

impl AgentCredentials {
    /// The rendered line is itself secret material; wrapping it keeps the
    /// copy zeroized once the injector is done with it.
    fn render_line(&self) -> Secret<String> {
        let line = serde_json::json!({
            "user": self.user,
            "password": self.password.expose_secret(),
            "leap_provider_hostname": self.leap_provider_hostname,
        });
        Secret::new(format!("{line}\n"))
    }
}

/// Hand credentials to an agent over its stdin.
///
/// The spawned task owns the write half: it writes the single line, shuts the
/// stream down so the agent sees EOF, and exits. The password never outlives
/// the task.
pub fn spawn_injector<W>(
    mut stdin: W,
    credentials: AgentCredentials,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let line = credentials.render_line();
        if let Err(e) = stdin.write_all(line.expose_secret().as_bytes()).await {
            tracing::warn!(user = %credentials.user, error = %e, "failed to deliver credentials to agent");
            return;
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::warn!(user = %credentials.user, error = %e, "failed to close agent stdin");
        }
    })
}
