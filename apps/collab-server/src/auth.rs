/// Authentication seam. Token validation itself is an external concern;
/// the server only consumes the capability.
use async_trait::async_trait;
use collab::AuthRequest;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &AuthRequest) -> bool;
}

/// Shared-token check. An empty configured token accepts any non-empty
/// client token; a client token is always required.
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &AuthRequest) -> bool {
        if credentials.token.is_empty() {
            return false;
        }
        self.token.is_empty() || credentials.token == self.token
    }
}
