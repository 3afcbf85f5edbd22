use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use rand::RngCore;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use sha2::Sha256;
use srp::client::SrpClient;
use srp::groups::G_1024;

use crate::errors::error_chain_fmt;
use crate::tls::TlsOptions;

/// Hard deadline for each request to the identity provider.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Session material handed back by the provider after a successful exchange.
/// The provider's `_session_id` cookie is deliberately not captured here; it
/// never travels further than the authenticator.
#[derive(Debug, Clone)]
pub struct LeapSession {
    pub user_name: String,
    pub id: String,
    pub token: String,
}

#[derive(thiserror::Error)]
pub enum LeapAuthError {
    #[error("Authentication failed")]
    AuthFailed(#[source] anyhow::Error),
    #[error("User already exists")]
    UserExists,
}

impl std::fmt::Debug for LeapAuthError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

fn auth_failed<E: Into<anyhow::Error>>(e: E) -> LeapAuthError {
    LeapAuthError::AuthFailed(e.into())
}

#[derive(Deserialize)]
struct Challenge {
    salt: String,
    #[serde(rename = "B")]
    b: String,
}

#[derive(Deserialize)]
struct Confirmation {
    #[serde(rename = "M2")]
    m2: String,
    id: String,
    token: String,
}

/// SRP-6a client against a LEAP identity provider: group `N_1024`, SHA-256,
/// values as lowercase padded hex in JSON bodies. The SRP math itself comes
/// from the `srp` crate; this type owns the wire exchange and the TLS policy.
pub struct SrpAuthenticator {
    http: reqwest::Client,
    api_url: String,
}

impl SrpAuthenticator {
    pub fn new(
        api_url: String,
        tls: &TlsOptions,
    ) -> Result<Self, anyhow::Error> {
        Self::with_timeout(api_url, tls, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        api_url: String,
        tls: &TlsOptions,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let http = crate::tls::build_client(tls, Some(timeout))
            .context("failed to build identity provider client")?;
        Ok(Self { http, api_url })
    }

    /// Two-round SRP login. Every failure mode (bad status, malformed hex,
    /// `B ≡ 0 (mod N)`, proof mismatch, timeout) collapses into `AuthFailed`;
    /// callers have no legitimate need to distinguish them.
    #[tracing::instrument(name = "SRP authentication", skip(self, password))]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &Secret<String>,
    ) -> Result<LeapSession, LeapAuthError> {
        let client = SrpClient::<Sha256>::new(&G_1024);
        let mut a = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut a);
        let a_pub = client.compute_public_ephemeral(&a);

        let handshake = self
            .http
            .post(format!("{}/1/sessions", self.api_url))
            .json(&serde_json::json!({
                "login": username,
                "A": hex::encode(&a_pub),
            }))
            .send()
            .await
            .map_err(auth_failed)?;
        if !handshake.status().is_success() {
            return Err(auth_failed(anyhow!(
                "session handshake rejected with {}",
                handshake.status()
            )));
        }
        let challenge: Challenge = handshake.json().await.map_err(auth_failed)?;
        let salt = hex::decode(&challenge.salt).map_err(auth_failed)?;
        let b_pub = hex::decode(&challenge.b).map_err(auth_failed)?;

        // rejects B ≡ 0 (mod N) among other illegal parameters
        let verifier = client
            .process_reply(
                &a,
                username.as_bytes(),
                password.expose_secret().as_bytes(),
                &salt,
                &b_pub,
            )
            .map_err(|e| auth_failed(anyhow!("invalid server challenge: {e}")))?;

        let confirmation = self
            .http
            .post(format!("{}/1/sessions/{}", self.api_url, username))
            .json(&serde_json::json!({
                "client_auth": hex::encode(verifier.proof()),
            }))
            .send()
            .await
            .map_err(auth_failed)?;
        if !confirmation.status().is_success() {
            return Err(auth_failed(anyhow!(
                "client proof rejected with {}",
                confirmation.status()
            )));
        }
        let confirmation: Confirmation = confirmation.json().await.map_err(auth_failed)?;
        let m2 = hex::decode(&confirmation.m2).map_err(auth_failed)?;
        verifier
            .verify_server(&m2)
            .map_err(|e| auth_failed(anyhow!("server proof mismatch: {e}")))?;

        Ok(LeapSession {
            user_name: username.to_string(),
            id: confirmation.id,
            token: confirmation.token,
        })
    }

    /// Register a fresh verifier with the provider.
    #[tracing::instrument(name = "SRP registration", skip(self, password))]
    pub async fn register(
        &self,
        username: &str,
        password: &Secret<String>,
    ) -> Result<(), LeapAuthError> {
        let client = SrpClient::<Sha256>::new(&G_1024);
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let verifier = client.compute_verifier(
            username.as_bytes(),
            password.expose_secret().as_bytes(),
            &salt,
        );

        let response = self
            .http
            .post(format!("{}/1/users", self.api_url))
            .json(&serde_json::json!({
                "login": username,
                "password_verifier": hex::encode(&verifier),
                "password_salt": hex::encode(salt),
            }))
            .send()
            .await
            .map_err(auth_failed)?;
        match response.status().as_u16() {
            201 => Ok(()),
            422 => Err(LeapAuthError::UserExists),
            status => Err(auth_failed(anyhow!("registration rejected with {status}"))),
        }
    }
}
