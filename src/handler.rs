use crate::cert::{CsrOptions, load_leaf_certificate};
use crate::generator::CertificateGenerator;
use crate::lock::ActionLock;
use crate::store::CertStore;
use anyhow::Context;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

pub const DEFAULT_EXPIRY_THRESHOLD_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GenerateOutcome {
    /// No certificate existed, a new one was issued and stored.
    Created,
    /// The stored certificate was about to expire and has been replaced.
    Renewed,
    /// The stored certificate is still valid for long enough.
    Skipped,
    /// Another evaluation of the same domain is running. Nothing was done.
    InProgress,
}

/// Decides per domain whether a certificate must be issued or renewed, and does so. At most
/// one evaluation per domain runs at a time.
pub struct CertHandler {
    generator: Arc<dyn CertificateGenerator>,
    store: Arc<dyn CertStore>,
    expiry_threshold_days: u32,
    lock: ActionLock,
}

impl CertHandler {
    pub fn new(
        generator: Arc<dyn CertificateGenerator>,
        store: Arc<dyn CertStore>,
        expiry_threshold_days: u32,
    ) -> Self {
        Self {
            generator,
            store,
            expiry_threshold_days,
            lock: ActionLock::new(),
        }
    }

    pub fn expiry_threshold_days(&self) -> u32 {
        self.expiry_threshold_days
    }

    pub async fn generate_or_renew_certificate(
        &self,
        common_name: &str,
        account_email: &str,
    ) -> anyhow::Result<GenerateOutcome> {
        self.lock
            .perform_action(common_name, Ok(GenerateOutcome::InProgress), || {
                self.evaluate(common_name, account_email)
            })
            .await
    }

    async fn evaluate(
        &self,
        common_name: &str,
        account_email: &str,
    ) -> anyhow::Result<GenerateOutcome> {
        self.store.prepare(common_name).await?;
        if !self.store.has_cert(common_name).await? {
            info!("No certificate for {common_name} yet, requesting one");
            self.issue(common_name, account_email).await?;
            return Ok(GenerateOutcome::Created);
        }
        if self.renewal_required(common_name).await? {
            self.issue(common_name, account_email).await?;
            return Ok(GenerateOutcome::Renewed);
        }
        Ok(GenerateOutcome::Skipped)
    }

    async fn renewal_required(&self, common_name: &str) -> anyhow::Result<bool> {
        let pem = self.store.get_cert(common_name).await?;
        let leaf = load_leaf_certificate(&pem)
            .context(format!("Stored certificate for {common_name} is unreadable"))?;
        let days_left = leaf.validity.days_till_expiry(OffsetDateTime::now_utc());
        if days_left < i64::from(self.expiry_threshold_days) {
            info!(
                "Certificate for {common_name} expires in {days_left} days (threshold {}), renewing",
                self.expiry_threshold_days
            );
            Ok(true)
        } else {
            debug!("Certificate for {common_name} is valid for {days_left} more days");
            Ok(false)
        }
    }

    async fn issue(&self, common_name: &str, account_email: &str) -> anyhow::Result<()> {
        let result = self
            .generator
            .generate(&CsrOptions::new(common_name), account_email)
            .await?;
        self.store.store(common_name, &result).await
    }
}
