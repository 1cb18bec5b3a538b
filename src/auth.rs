use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared service password for every connection, checked by pgwire's
/// cleartext startup flow. Per-request user identity arrives pre-validated
/// from upstream and is never derived from the login.
#[derive(Debug)]
pub struct BookendAuthSource {
    secret: Vec<u8>,
}

impl BookendAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            secret: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for BookendAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        // Unsalted: cleartext auth compares the raw secret.
        Ok(Password::new(None, self.secret.clone()))
    }
}
