use crate::acme::{Authorization, Challenge, ChallengeType};
use crate::challenge::ChallengeHandler;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CHALLENGE_RECORD_PREFIX: &str = "_acme-challenge";
pub const CHALLENGE_RECORD_TTL: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Caa,
    Cname,
    Mx,
    Ns,
    Srv,
    Txt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub name: String,
    pub content: String,
    pub ttl: u32,
}

/// The owner name of the dns-01 TXT record for an authorization. Wildcard authorizations
/// carry the base domain as identifier, so no special casing is needed.
pub fn challenge_record_name(authz: &Authorization) -> String {
    format!("{CHALLENGE_RECORD_PREFIX}.{}", authz.identifier)
}

/// The TXT record proving control over the authorization's identifier.
pub fn challenge_record(authz: &Authorization, key_authorization: &str) -> DnsRecord {
    DnsRecord {
        record_type: RecordType::Txt,
        name: challenge_record_name(authz),
        content: key_authorization.to_string(),
        ttl: CHALLENGE_RECORD_TTL,
    }
}

/// A DNS hosting API able to manage records in one zone.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create `record` and return the provider's identifier for it.
    async fn add_record(&self, record: &DnsRecord) -> anyhow::Result<String>;

    /// Look up an existing record with the same type, name and content.
    async fn find_record(&self, record: &DnsRecord) -> anyhow::Result<Option<String>>;

    async fn delete_record(&self, id: &str) -> anyhow::Result<()>;
}

/// Solves dns-01 through any [`DnsProvider`].
pub struct DnsChallengeHandler<P> {
    provider: P,
}

impl<P: DnsProvider> DnsChallengeHandler<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: DnsProvider> ChallengeHandler for DnsChallengeHandler<P> {
    fn types(&self) -> Vec<ChallengeType> {
        vec![ChallengeType::Dns01]
    }

    async fn create(
        &self,
        authz: &Authorization,
        _challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let record = challenge_record(authz, key_authorization);
        let id = self
            .provider
            .add_record(&record)
            .await
            .context(format!("Creating TXT record {} failed", record.name))?;
        debug!("Created TXT record {} with id {id}", record.name);
        Ok(true)
    }

    async fn remove(
        &self,
        authz: &Authorization,
        _challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<bool> {
        let record = challenge_record(authz, key_authorization);
        let id = self
            .provider
            .find_record(&record)
            .await
            .context(format!("Looking up TXT record {} failed", record.name))?
            .with_context(|| format!("Failed to find TXT record {} to remove", record.name))?;
        self.provider
            .delete_record(&id)
            .await
            .context(format!("Deleting TXT record {} failed", record.name))?;
        debug!("Removed TXT record {} with id {id}", record.name);
        Ok(true)
    }
}
