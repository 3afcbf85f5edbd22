use std::future::ready;
use std::future::Ready;

use actix_session::Session;
use actix_session::SessionExt;
use actix_session::SessionGetError;
use actix_session::SessionInsertError;
use actix_web::FromRequest;
use uuid::Uuid;

/// Wrapper around `actix_session::Session` for strict typing: keys are
/// methods instead of strings, and the xsrf token handling lives next to the
/// login state it protects.
pub struct TypedSession(Session);

impl TypedSession {
    const USER_KEY: &'static str = "user";
    const XSRF_KEY: &'static str = "_xsrf";

    /// Rotate the session id; called on privilege change (login).
    pub fn renew(&self) {
        self.0.renew();
    }

    pub fn log_in(
        &self,
        user: &str,
    ) -> Result<(), SessionInsertError> {
        self.0.insert(Self::USER_KEY, user)
    }

    pub fn get_user(&self) -> Result<Option<String>, SessionGetError> {
        self.0.get(Self::USER_KEY)
    }

    pub fn log_out(&self) {
        self.0.purge();
    }

    /// Mint (or reuse) the token the login form must echo back.
    pub fn issue_xsrf_token(&self) -> Result<String, SessionInsertError> {
        if let Ok(Some(token)) = self.xsrf_token() {
            return Ok(token);
        }
        let token = Uuid::new_v4().simple().to_string();
        self.0.insert(Self::XSRF_KEY, &token)?;
        Ok(token)
    }

    pub fn xsrf_token(&self) -> Result<Option<String>, SessionGetError> {
        self.0.get(Self::XSRF_KEY)
    }
}

impl FromRequest for TypedSession {
    // reuse the error type of `Session`'s own `FromRequest` impl
    type Error = <Session as FromRequest>::Error;
    type Future = Ready<Result<TypedSession, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        ready(Ok(TypedSession(req.get_session())))
    }
}
