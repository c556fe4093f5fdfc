use async_trait::async_trait;

use crate::AuthBackend;

/// Single username/password pair, as configured for the submission endpoint.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthBackend for StaticCredentials {
    async fn validate(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}
