//! The crate's view of an ACME server. Protocol details (JWS, nonces, account registration) are
//! handled by `instant-acme`; the rest of the crate only sees the types and traits below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use time::OffsetDateTime;
use url::Url;

pub mod client;
pub mod verify;

pub use client::InstantAcmeClientFactory;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Which ACME directory to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeDirectory {
    LetsEncryptProduction,
    LetsEncryptStaging,
    Custom(Url),
}

impl AcmeDirectory {
    pub fn from_staging_flag(staging: bool) -> Self {
        if staging {
            Self::LetsEncryptStaging
        } else {
            Self::LetsEncryptProduction
        }
    }

    /// File-system safe name of the directory's server, e.g. `acme-v02.api.letsencrypt.org`.
    /// Accounts are only valid at the server they were registered with.
    pub fn storage_name(&self) -> String {
        let (host, port) = match self {
            Self::LetsEncryptProduction => ("acme-v02.api.letsencrypt.org", None),
            Self::LetsEncryptStaging => ("acme-staging-v02.api.letsencrypt.org", None),
            Self::Custom(url) => (url.host_str().unwrap_or("custom"), url.port()),
        };
        let mut name: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        if let Some(port) = port {
            name.push_str(&format!("_{port}"));
        }
        name
    }

    pub fn url(&self) -> &str {
        match self {
            Self::LetsEncryptProduction => LETS_ENCRYPT_PRODUCTION,
            Self::LetsEncryptStaging => LETS_ENCRYPT_STAGING,
            Self::Custom(url) => url.as_str(),
        }
    }
}

impl Display for AcmeDirectory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl Display for ChallengeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeType::Http01 => write!(f, "http-01"),
            ChallengeType::Dns01 => write!(f, "dns-01"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub token: String,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub validated: Option<OffsetDateTime>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Identifier {
    Dns(String),
}

impl Identifier {
    pub fn value(&self) -> &str {
        match self {
            Identifier::Dns(value) => value,
        }
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Dns(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// Pick the first challenge offered for the most preferred type in `priority`.
    pub fn select_challenge(&self, priority: &[ChallengeType]) -> Option<&Challenge> {
        priority.iter().find_map(|wanted| {
            self.challenges
                .iter()
                .find(|challenge| challenge.challenge_type == *wanted)
        })
    }

    /// Collect the problems the CA reported on this authorization's challenges.
    pub fn problems(&self) -> Vec<String> {
        self.challenges
            .iter()
            .filter_map(|challenge| {
                challenge
                    .error
                    .as_ref()
                    .map(|error| format!("{}: {error}", challenge.challenge_type))
            })
            .collect()
    }
}

/// Creates ACME clients bound to the account of a given email address.
#[async_trait]
pub trait AcmeClientFactory: Send + Sync {
    async fn create(&self, account_email: &str) -> anyhow::Result<Box<dyn AcmeClient>>;
}

#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn new_order(&self, identifiers: &[Identifier]) -> anyhow::Result<Box<dyn AcmeOrder>>;
}

/// A single certificate order. The methods are called in order: `authorizations`, then per
/// challenge `key_authorization`/`set_challenge_ready`/`poll_authorization`, then `finalize`.
#[async_trait]
pub trait AcmeOrder: Send {
    async fn authorizations(&mut self) -> anyhow::Result<Vec<Authorization>>;

    /// The value a challenge handler must publish: the key authorization for http-01, its
    /// digest for dns-01.
    fn key_authorization(&self, challenge: &Challenge) -> String;

    async fn set_challenge_ready(&mut self, challenge: &Challenge) -> anyhow::Result<()>;

    /// Wait until the authorization for `identifier` is no longer pending and return it.
    async fn poll_authorization(&mut self, identifier: &Identifier)
    -> anyhow::Result<Authorization>;

    /// Finalize the order with the DER encoded CSR and return the issued full chain as PEM.
    async fn finalize(&mut self, csr_der: &[u8]) -> anyhow::Result<String>;
}
