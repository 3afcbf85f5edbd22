use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;

/// Walk the `source` chain when formatting an error for logs, so the root
/// cause is never swallowed by a top-level message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

/// Every failure the manager can report, in one place. The HTTP mapping lives
/// in the `ResponseError` impl below; the manager client performs the inverse
/// mapping on its side.
#[derive(thiserror::Error)]
pub enum DispatcherError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Unknown agent: {0}")]
    NotFound(String),
    #[error("Agent {0} already exists")]
    Exists(String),
    #[error("Instance {0} already running")]
    InstanceAlreadyRunning(String),
    #[error("Instance {0} not running")]
    InstanceNotRunning(String),
    #[error("Provider is still initializing")]
    ProviderInitializing,
    #[error("Not enough free memory to start agent")]
    NotEnoughFreeMemory,
    #[error("No free port left in the pool")]
    PoolExhausted,
    #[error("Authentication failed")]
    AuthFailed(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl std::fmt::Debug for DispatcherError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for DispatcherError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Exists(_) | Self::InstanceAlreadyRunning(_) | Self::InstanceNotRunning(_) => {
                StatusCode::CONFLICT
            }
            Self::ProviderInitializing | Self::NotEnoughFreeMemory | Self::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::AuthFailed(_) => StatusCode::FORBIDDEN,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, Self::Unexpected(_)) {
            tracing::error!(error.cause_chain = ?self, error.message = %self, "unexpected error");
            // the chain is only exposed to clients in debug builds; production
            // gets a fixed string and the trace stays in the logs
            let body = if cfg!(debug_assertions) {
                format!("{:?}", self)
            } else {
                "Internal server error".to_string()
            };
            return HttpResponse::build(self.status_code()).body(body);
        }
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}
