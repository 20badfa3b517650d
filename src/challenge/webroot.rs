use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;

use crate::challenge::{ChallengePublisher, PublishError, validate_token};

const WELL_KNOWN_DIR: &str = ".well-known/acme-challenge";

/// Writes proofs under every configured document root so the CA finds them
/// whichever application serves the domain.
#[derive(Debug, Clone)]
pub struct WebrootPublisher {
    document_roots: Vec<PathBuf>,
}

impl WebrootPublisher {
    pub fn new(document_roots: Vec<PathBuf>) -> Self {
        Self { document_roots }
    }

    fn challenge_path(root: &Path, token: &str) -> PathBuf {
        root.join(WELL_KNOWN_DIR).join(token)
    }
}

#[async_trait]
impl ChallengePublisher for WebrootPublisher {
    async fn publish(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), PublishError> {
        validate_token(token)?;
        for root in &self.document_roots {
            let dir = root.join(WELL_KNOWN_DIR);
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| PublishError::Io {
                    path: dir.clone(),
                    source,
                })?;
            let path = Self::challenge_path(root, token);
            fs::write(&path, key_authorization.as_bytes())
                .await
                .map_err(|source| PublishError::Io {
                    path: path.clone(),
                    source,
                })?;
            debug!("[webroot] wrote {} for {}", path.display(), domain);
        }
        info!(
            "[webroot] published challenge for {} in {} document root(s)",
            domain,
            self.document_roots.len()
        );
        Ok(())
    }

    async fn withdraw(&self, domain: &str, token: &str) -> Result<(), PublishError> {
        validate_token(token)?;
        for root in &self.document_roots {
            let path = Self::challenge_path(root, token);
            match fs::remove_file(&path).await {
                Ok(()) => debug!("[webroot] removed {} for {}", path.display(), domain),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(PublishError::Io { path, source }),
            }
        }
        Ok(())
    }
}
