use crate::USER_AGENT;
use crate::acme::{Authorization, Challenge, ChallengeType};
use crate::challenge::dns::challenge_record_name;
use crate::challenge::webroot::CHALLENGE_DIRECTORY;
use anyhow::{Context, bail};
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{debug, warn};

/// Checks that a deployed challenge is visible from the outside before the CA is asked to
/// validate it.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn verify(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<()>;
}

pub struct SelfVerifier {
    http: reqwest::Client,
    resolver: hickory_resolver::Resolver<TokioConnectionProvider>,
}

impl SelfVerifier {
    pub fn try_new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Building HTTP client failed")?;
        let resolver = hickory_resolver::Resolver::builder_tokio()
            .unwrap_or_else(|e| {
                warn!("Failed to create DNS resolver using system configuration, using default servers instead: {e:#}");
                hickory_resolver::Resolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
            })
            .build();
        Ok(Self { http, resolver })
    }

    async fn verify_http(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        let url = format!(
            "http://{}/{CHALLENGE_DIRECTORY}/{}",
            authz.identifier, challenge.token
        );
        debug!("Verifying http-01 challenge at {url}");
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .context(format!("Fetching {url} failed"))?
            .error_for_status()
            .context(format!("Fetching {url} failed"))?
            .text()
            .await?;
        if body.trim() != key_authorization {
            bail!("{url} does not serve the expected key authorization");
        }
        Ok(())
    }

    async fn verify_dns(&self, authz: &Authorization, key_authorization: &str) -> anyhow::Result<()> {
        let name = challenge_record_name(authz);
        debug!("Verifying dns-01 challenge at {name}");
        let lookup = self
            .resolver
            .txt_lookup(name.as_str())
            .await
            .context(format!("Looking up TXT records for {name} failed"))?;
        let found = lookup.iter().any(|txt| {
            let value: String = txt
                .txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data))
                .collect();
            value == key_authorization
        });
        if !found {
            bail!("No TXT record at {name} carries the expected value");
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeVerifier for SelfVerifier {
    async fn verify(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        match challenge.challenge_type {
            ChallengeType::Http01 => self.verify_http(authz, challenge, key_authorization).await,
            ChallengeType::Dns01 => self.verify_dns(authz, key_authorization).await,
        }
    }
}
