use crate::account::AccountKeyProvider;
use crate::acme::{
    AcmeClient, AcmeClientFactory, AcmeOrder, Authorization, AuthorizationStatus, Challenge,
    ChallengeStatus, ChallengeType, Identifier,
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use instant_acme::{Account, AccountCredentials, NewOrder, Order, OrderStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POLL_ATTEMPTS: u32 = 10;
const POLL_BASE_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(30);

fn backoff(attempt: u32) -> Duration {
    POLL_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(POLL_MAX_DELAY)
}

/// Builds `instant-acme` clients from the account credentials held by an
/// [`AccountKeyProvider`].
pub struct InstantAcmeClientFactory {
    key_provider: Arc<dyn AccountKeyProvider>,
}

impl InstantAcmeClientFactory {
    pub fn new(key_provider: Arc<dyn AccountKeyProvider>) -> Self {
        Self { key_provider }
    }
}

#[async_trait]
impl AcmeClientFactory for InstantAcmeClientFactory {
    async fn create(&self, account_email: &str) -> anyhow::Result<Box<dyn AcmeClient>> {
        let key = self.key_provider.account_key(account_email).await?;
        let credentials: AccountCredentials = serde_json::from_slice(key.as_bytes())
            .context(format!(
                "Stored account key for {account_email} is not a valid ACME account credential"
            ))?;
        let account = Account::from_credentials(credentials)
            .await
            .context(format!("Loading ACME account for {account_email} failed"))?;
        Ok(Box::new(InstantAcmeClient { account }))
    }
}

struct InstantAcmeClient {
    account: Account,
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn new_order(&self, identifiers: &[Identifier]) -> anyhow::Result<Box<dyn AcmeOrder>> {
        let acme_identifiers: Vec<instant_acme::Identifier> = identifiers
            .iter()
            .map(|identifier| instant_acme::Identifier::Dns(identifier.value().to_string()))
            .collect();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &acme_identifiers,
            })
            .await
            .context("Error creating new order")?;
        debug!("Order URL: {}", order.url());
        let wildcards = identifiers
            .iter()
            .filter_map(|identifier| identifier.value().strip_prefix("*."))
            .map(str::to_string)
            .collect();
        Ok(Box::new(InstantAcmeOrder {
            order,
            authorizations: Vec::new(),
            wildcards,
        }))
    }
}

struct InstantAcmeOrder {
    order: Order,
    /// The most recently fetched authorizations, needed to compute key authorizations.
    authorizations: Vec<instant_acme::Authorization>,
    /// Base domains requested as `*.domain`.
    wildcards: HashSet<String>,
}

impl InstantAcmeOrder {
    async fn refresh_authorizations(&mut self) -> anyhow::Result<Vec<Authorization>> {
        self.authorizations = self
            .order
            .authorizations()
            .await
            .context("Retrieving authorizations from server")?;
        Ok(self
            .authorizations
            .iter()
            .map(|authz| convert_authorization(authz, &self.wildcards))
            .collect())
    }

    async fn wait_until_ready(&mut self) -> anyhow::Result<()> {
        for attempt in 0..POLL_ATTEMPTS {
            let state = self.order.refresh().await.context("Refreshing order")?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => bail!("The CA marked the order as invalid"),
                _ => {
                    let delay = backoff(attempt);
                    debug!("Order not ready yet, checking again in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        bail!("Order did not become ready after {POLL_ATTEMPTS} attempts")
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> anyhow::Result<Vec<Authorization>> {
        self.refresh_authorizations().await
    }

    fn key_authorization(&self, challenge: &Challenge) -> String {
        let acme_challenge = self
            .authorizations
            .iter()
            .flat_map(|authz| &authz.challenges)
            .find(|candidate| candidate.url == challenge.url);
        match acme_challenge {
            Some(acme_challenge) => {
                let key_authorization = self.order.key_authorization(acme_challenge);
                match challenge.challenge_type {
                    ChallengeType::Http01 => key_authorization.as_str().to_string(),
                    ChallengeType::Dns01 => key_authorization.dns_value(),
                }
            }
            // Only challenges we handed out ourselves can end up here
            None => String::new(),
        }
    }

    async fn set_challenge_ready(&mut self, challenge: &Challenge) -> anyhow::Result<()> {
        self.order
            .set_challenge_ready(&challenge.url)
            .await
            .context(format!("Requesting validation of {}", challenge.url))
    }

    async fn poll_authorization(
        &mut self,
        identifier: &Identifier,
    ) -> anyhow::Result<Authorization> {
        for attempt in 0..POLL_ATTEMPTS {
            tokio::time::sleep(backoff(attempt)).await;
            let current = self
                .refresh_authorizations()
                .await?
                .into_iter()
                .find(|authz| &authz.identifier == identifier)
                .context(format!("Order no longer contains an authorization for {identifier}"))?;
            if current.status != AuthorizationStatus::Pending {
                return Ok(current);
            }
            debug!("Authorization for {identifier} still pending");
        }
        bail!("Authorization for {identifier} still pending after {POLL_ATTEMPTS} attempts")
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> anyhow::Result<String> {
        self.wait_until_ready().await?;
        debug!("Finalizing order");
        self.order
            .finalize(csr_der)
            .await
            .context("Finalizing order")?;
        for attempt in 0..POLL_ATTEMPTS {
            if let Some(chain) = self
                .order
                .certificate()
                .await
                .context("Downloading certificate")?
            {
                return Ok(chain);
            }
            tokio::time::sleep(backoff(attempt)).await;
        }
        bail!("Certificate was not issued after {POLL_ATTEMPTS} attempts")
    }
}

fn convert_authorization(
    authz: &instant_acme::Authorization,
    wildcards: &HashSet<String>,
) -> Authorization {
    #[allow(unreachable_patterns)]
    let value = match &authz.identifier {
        instant_acme::Identifier::Dns(value) => value.clone(),
        other => format!("{other:?}"),
    };
    #[allow(unreachable_patterns)]
    let status = match authz.status {
        instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
        instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
        instant_acme::AuthorizationStatus::Invalid => AuthorizationStatus::Invalid,
        instant_acme::AuthorizationStatus::Revoked => AuthorizationStatus::Revoked,
        instant_acme::AuthorizationStatus::Expired => AuthorizationStatus::Expired,
        _ => AuthorizationStatus::Deactivated,
    };
    Authorization {
        wildcard: wildcards.contains(&value),
        identifier: Identifier::Dns(value),
        status,
        challenges: authz.challenges.iter().filter_map(convert_challenge).collect(),
        expires: None,
    }
}

/// instant-acme does not export its challenge status type, so map its `Debug` name.
fn challenge_status(name: &str) -> ChallengeStatus {
    match name {
        "Pending" => ChallengeStatus::Pending,
        "Processing" => ChallengeStatus::Processing,
        "Valid" => ChallengeStatus::Valid,
        _ => ChallengeStatus::Invalid,
    }
}

fn convert_challenge(challenge: &instant_acme::Challenge) -> Option<Challenge> {
    let challenge_type = match challenge.r#type {
        instant_acme::ChallengeType::Http01 => ChallengeType::Http01,
        instant_acme::ChallengeType::Dns01 => ChallengeType::Dns01,
        _ => return None,
    };
    let status = challenge_status(&format!("{:?}", challenge.status));
    let error = challenge.error.as_ref().map(|problem| {
        problem
            .detail
            .clone()
            .or_else(|| problem.r#type.clone())
            .unwrap_or_else(|| "unspecified problem".to_string())
    });
    Some(Challenge {
        challenge_type,
        token: challenge.token.clone(),
        url: challenge.url.clone(),
        status,
        validated: None,
        error,
    })
}
