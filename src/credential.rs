//! Login credentials.
//!
//! A credential is used once per session to obtain auth state and is never persisted.

use std::fmt;

#[derive(Clone)]
pub struct Credential {
    pub account: String,
    pub password: String,
}

impl Credential {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}
