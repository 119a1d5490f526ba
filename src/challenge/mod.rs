use crate::acme::{Authorization, Challenge, ChallengeType};
use async_trait::async_trait;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub mod cloudflare;
pub mod dns;
pub mod webroot;

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("Unsupported challenge type {0}")]
    UnsupportedChallengeType(ChallengeType),
}

/// Publishes (and later retracts) the proof for one or more ACME challenge types.
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Challenge types this handler can satisfy, most preferred first.
    fn types(&self) -> Vec<ChallengeType>;

    async fn create(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool>;

    async fn remove(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool>;
}

/// Routes challenges to the handler registered for their type. Later handlers replace earlier
/// ones for the types they share.
pub struct ChallengeDispatcher {
    handlers: HashMap<ChallengeType, Arc<dyn ChallengeHandler>>,
    types: Vec<ChallengeType>,
}

impl ChallengeDispatcher {
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn ChallengeHandler>>) -> Self {
        let mut registry = HashMap::new();
        let mut types = Vec::new();
        for handler in handlers {
            for challenge_type in handler.types() {
                if registry
                    .insert(challenge_type, Arc::clone(&handler))
                    .is_none()
                {
                    types.push(challenge_type);
                }
            }
        }
        debug!(
            "Challenge dispatcher supports: {}",
            types.iter().join(", ")
        );
        Self {
            handlers: registry,
            types,
        }
    }

    fn handler_for(
        &self,
        challenge_type: ChallengeType,
    ) -> Result<&Arc<dyn ChallengeHandler>, ChallengeError> {
        self.handlers
            .get(&challenge_type)
            .ok_or(ChallengeError::UnsupportedChallengeType(challenge_type))
    }
}

#[async_trait]
impl ChallengeHandler for ChallengeDispatcher {
    fn types(&self) -> Vec<ChallengeType> {
        self.types.clone()
    }

    async fn create(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let handler = self.handler_for(challenge.challenge_type)?;
        handler.create(authz, challenge, key_authorization).await
    }

    async fn remove(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let handler = self.handler_for(challenge.challenge_type)?;
        handler.remove(authz, challenge, key_authorization).await
    }
}
