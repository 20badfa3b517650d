//! Publication of HTTP-01 key authorizations.
//!
//! The CA fetches `http://<domain>/.well-known/acme-challenge/<token>` and expects
//! the key authorization as the body. Shared hosts publish it by dropping a file
//! into the site's document root ([`webroot::WebrootPublisher`]); hosts that can
//! accept connections on port 80 (directly or through a relay) use the built-in
//! server ([`standalone::StandaloneResponder`]).

pub mod standalone;
pub mod webroot;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("challenge token {0:?} contains characters outside the base64url alphabet")]
    InvalidToken(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind HTTP-01 responder on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Makes a key authorization reachable by the CA and removes it afterwards.
#[async_trait]
pub trait ChallengePublisher: Send + Sync {
    async fn publish(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), PublishError>;

    /// Removing a proof that was never published is not an error.
    async fn withdraw(&self, domain: &str, token: &str) -> Result<(), PublishError>;
}

/// Tokens become file names and URL segments, so only base64url is accepted.
pub fn validate_token(token: &str) -> Result<(), PublishError> {
    let valid = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(PublishError::InvalidToken(token.to_string()))
    }
}
