use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-secret authentication: every role logs in with the server
/// password from `COURTD_PASSWORD`. Roles are not checked; requester and
/// owner identity travel in the statements themselves.
#[derive(Debug)]
pub struct CourtdAuthSource {
    password: String,
}

impl CourtdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CourtdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            "login attempt: user={:?} database={:?}",
            login.user(),
            login.database()
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
