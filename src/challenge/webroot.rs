use crate::acme::{Authorization, Challenge, ChallengeType};
use crate::challenge::ChallengeHandler;
use crate::fs::ensure_directory;
use anyhow::{Context, bail};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const CHALLENGE_DIRECTORY: &str = ".well-known/acme-challenge";

/// Solves http-01 by placing the key authorization below the document root of a web server
/// that already serves the domain.
#[derive(Debug, Clone)]
pub struct WebrootChallengeHandler {
    webroot: PathBuf,
}

impl WebrootChallengeHandler {
    /// Fails unless `webroot` is an existing, writable directory.
    pub async fn try_new(webroot: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let webroot = webroot.into();
        ensure_directory(&webroot, false)
            .await
            .context(format!("Webroot {} is unusable", webroot.display()))?;
        Ok(Self { webroot })
    }

    pub fn challenge_path(&self, token: &str) -> PathBuf {
        self.webroot.join(Path::new(CHALLENGE_DIRECTORY)).join(token)
    }

    fn checked_challenge_path(&self, token: &str) -> anyhow::Result<PathBuf> {
        // Tokens are base64url, anything else could escape the challenge directory
        let valid = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            bail!("Refusing to use challenge token {token:?} as a file name");
        }
        Ok(self.challenge_path(token))
    }

    async fn prune_empty_directories(&self) {
        let challenge_dir = self.webroot.join(CHALLENGE_DIRECTORY);
        for dir in challenge_dir.ancestors() {
            if dir == self.webroot {
                break;
            }
            // Fails for non-empty directories, which we must leave alone
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl ChallengeHandler for WebrootChallengeHandler {
    fn types(&self) -> Vec<ChallengeType> {
        vec![ChallengeType::Http01]
    }

    async fn create(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let challenge_file = self.checked_challenge_path(&challenge.token)?;
        if let Some(parent) = challenge_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Creating challenge directory {} failed", parent.display()))?;
        }
        let mut file = File::create(&challenge_file).await.context(format!(
            "Creating challenge file {} failed",
            challenge_file.display()
        ))?;
        file.write_all(key_authorization.as_bytes())
            .await
            .context(format!(
                "Writing challenge file {} failed",
                challenge_file.display()
            ))?;
        file.flush().await?;
        debug!(
            "Placed http-01 challenge for {} at {}",
            authz.identifier,
            challenge_file.display()
        );
        Ok(true)
    }

    async fn remove(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        _key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let challenge_file = self.checked_challenge_path(&challenge.token)?;
        let removed = match tokio::fs::remove_file(&challenge_file).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Challenge file {} for {} was already gone",
                    challenge_file.display(),
                    authz.identifier
                );
                false
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Removing challenge file {} failed",
                    challenge_file.display()
                ));
            }
        };
        self.prune_empty_directories().await;
        Ok(removed)
    }
}
