//! The authentication seam between the handshake and the application.
//!
//! The server consumes an [`Authenticator`], the client a
//!  [`ChallengeResponder`]. The no-auth pair ([`NoAuthenticator`] /
//!  [`EchoResponder`]) still traverses the full four-state handshake with an
//!  empty challenge, so going from an open server to an authenticated one is
//!  purely a configuration change.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Server-side authentication hooks. `client_id` is the id the server will
///  assign if (and only if) authentication succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Produces the challenge sent to a connecting client. May be empty.
    async fn get_challenge_for(&self, client_id: u64) -> Vec<u8>;

    /// Decides whether `response` answers `challenge` for this client.
    async fn authenticate(&self, client_id: u64, challenge: &[u8], response: &[u8]) -> bool;
}

/// Client-side counterpart: turns the server's challenge into a response.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChallengeResponder: Send + Sync + 'static {
    async fn respond(&self, challenge: &[u8]) -> Vec<u8>;
}

/// Accepts any client that echoes the (empty) challenge back.
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn get_challenge_for(&self, _client_id: u64) -> Vec<u8> {
        Vec::new()
    }

    async fn authenticate(&self, _client_id: u64, challenge: &[u8], response: &[u8]) -> bool {
        challenge == response
    }
}

/// The responder matching [`NoAuthenticator`]: answers with the challenge
///  itself.
pub struct EchoResponder;

#[async_trait]
impl ChallengeResponder for EchoResponder {
    async fn respond(&self, challenge: &[u8]) -> Vec<u8> {
        challenge.to_vec()
    }
}

/// Shared-password authentication: the challenge is empty, the response must
///  be the password.
pub struct PasswordAuthenticator {
    password: Vec<u8>,
}

impl PasswordAuthenticator {
    pub fn new(password: impl Into<Vec<u8>>) -> PasswordAuthenticator {
        PasswordAuthenticator { password: password.into() }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn get_challenge_for(&self, _client_id: u64) -> Vec<u8> {
        Vec::new()
    }

    async fn authenticate(&self, _client_id: u64, _challenge: &[u8], response: &[u8]) -> bool {
        response == self.password
    }
}

/// Client-side counterpart of [`PasswordAuthenticator`].
pub struct PasswordResponder {
    password: Vec<u8>,
}

impl PasswordResponder {
    pub fn new(password: impl Into<Vec<u8>>) -> PasswordResponder {
        PasswordResponder { password: password.into() }
    }
}

#[async_trait]
impl ChallengeResponder for PasswordResponder {
    async fn respond(&self, _challenge: &[u8]) -> Vec<u8> {
        self.password.clone()
    }
}
