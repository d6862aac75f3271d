use std::sync::Arc;

use parking_lot::RwLock;

/// Source of the opaque session credential the login flow stores.
///
/// The hub only checks for presence: a connection is attempted while a token
/// exists and automatic reconnection stops once it is gone.
pub trait CredentialSource: Send + Sync {
    fn token(&self) -> Option<String>;

    fn is_present(&self) -> bool {
        self.token().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Clone, Default)]
pub struct SessionCredential {
    token: Arc<RwLock<Option<String>>>,
}

impl SessionCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let cred = Self::new();
        cred.set(token);
        cred
    }

    /// Called by the login flow.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Called on logout.
    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialSource for SessionCredential {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}
