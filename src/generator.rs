use crate::acme::verify::ChallengeVerifier;
use crate::acme::{
    AcmeClientFactory, AcmeOrder, Authorization, AuthorizationStatus, Challenge, Identifier,
};
use crate::cert::{CsrOptions, ca_certificate_from_chain, create_csr};
use crate::challenge::ChallengeHandler;
use anyhow::{Context, bail};
use async_trait::async_trait;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issued certificate material, all PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResult {
    pub private_key: String,
    /// The full chain, leaf first.
    pub certificate: String,
    /// The last certificate of the chain.
    pub ca_cert: String,
}

impl CertificateResult {
    pub fn from_chain(private_key: String, full_chain: String) -> anyhow::Result<Self> {
        let ca_cert = ca_certificate_from_chain(&full_chain)?;
        Ok(Self {
            private_key,
            certificate: full_chain,
            ca_cert,
        })
    }
}

#[async_trait]
pub trait CertificateGenerator: Send + Sync {
    async fn generate(
        &self,
        csr_options: &CsrOptions,
        account_email: &str,
    ) -> anyhow::Result<CertificateResult>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Do not check that a deployed challenge is reachable before asking the CA to validate it.
    pub skip_challenge_verification: bool,
}

/// Issues certificates through an ACME CA, satisfying challenges with the given handler.
pub struct AcmeCertificateGenerator {
    client_factory: Arc<dyn AcmeClientFactory>,
    challenge_handler: Arc<dyn ChallengeHandler>,
    verifier: Arc<dyn ChallengeVerifier>,
    options: GeneratorOptions,
}

impl AcmeCertificateGenerator {
    pub fn new(
        client_factory: Arc<dyn AcmeClientFactory>,
        challenge_handler: Arc<dyn ChallengeHandler>,
        verifier: Arc<dyn ChallengeVerifier>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            client_factory,
            challenge_handler,
            verifier,
            options,
        }
    }

    async fn authorize(&self, order: &mut dyn AcmeOrder) -> anyhow::Result<()> {
        let authorizations = order.authorizations().await?;
        let priority = self.challenge_handler.types();
        for authz in authorizations {
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!("Authorization for {} is already valid", authz.identifier);
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => bail!(
                    "Authorization for {} is {status:?}, cannot continue",
                    authz.identifier
                ),
            }
            let challenge = authz
                .select_challenge(&priority)
                .with_context(|| {
                    format!(
                        "The CA offers no supported challenge for {} (supported: {})",
                        authz.identifier,
                        priority.iter().join(", ")
                    )
                })?
                .clone();
            let key_authorization = order.key_authorization(&challenge);

            let solved = self
                .solve(order, &authz, &challenge, &key_authorization)
                .await;
            match self
                .challenge_handler
                .remove(&authz, &challenge, &key_authorization)
                .await
            {
                Ok(true) => debug!("Removed {} challenge for {}", challenge.challenge_type, authz.identifier),
                Ok(false) => debug!(
                    "Nothing to clean up for {} challenge of {}",
                    challenge.challenge_type, authz.identifier
                ),
                Err(e) => warn!(
                    "Cleaning up {} challenge for {} failed: {e:#}",
                    challenge.challenge_type, authz.identifier
                ),
            }
            solved?;
        }
        Ok(())
    }

    async fn solve(
        &self,
        order: &mut dyn AcmeOrder,
        authz: &Authorization,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        let identifier = &authz.identifier;
        let created = self
            .challenge_handler
            .create(authz, challenge, key_authorization)
            .await
            .context(format!(
                "Deploying {} challenge for {identifier} failed",
                challenge.challenge_type
            ))?;
        if !created {
            bail!(
                "Challenge handler declined the {} challenge for {identifier}",
                challenge.challenge_type
            );
        }
        if self.options.skip_challenge_verification {
            debug!("Skipping self-verification of {identifier}");
        } else {
            self.verifier
                .verify(authz, challenge, key_authorization)
                .await
                .context(format!(
                    "{} challenge for {identifier} is not reachable",
                    challenge.challenge_type
                ))?;
        }
        order.set_challenge_ready(challenge).await?;
        let polled = order.poll_authorization(identifier).await?;
        if polled.status != AuthorizationStatus::Valid {
            let problems = polled.problems();
            bail!(
                "Authorization for {identifier} ended as {:?}: {}",
                polled.status,
                if problems.is_empty() {
                    "no details given".to_string()
                } else {
                    problems.join("; ")
                }
            );
        }
        info!("Authorized {identifier} via {}", challenge.challenge_type);
        Ok(())
    }
}

#[async_trait]
impl CertificateGenerator for AcmeCertificateGenerator {
    async fn generate(
        &self,
        csr_options: &CsrOptions,
        account_email: &str,
    ) -> anyhow::Result<CertificateResult> {
        let common_name = &csr_options.common_name;
        let client = self
            .client_factory
            .create(account_email)
            .await
            .context(format!("Creating ACME client for {account_email} failed"))?;
        let request = create_csr(csr_options)?;
        let identifiers = csr_options
            .domains()
            .iter()
            .map(|domain| Identifier::from(domain.as_str()))
            .collect::<Vec<_>>();

        info!(
            "Ordering certificate for {}",
            identifiers.iter().join(", ")
        );
        let mut order = client.new_order(&identifiers).await?;
        self.authorize(order.as_mut())
            .await
            .context(format!("Authorizing order for {common_name} failed"))?;
        let full_chain = order
            .finalize(request.der())
            .await
            .context(format!("Finalizing order for {common_name} failed"))?;
        info!("Certificate for {common_name} issued");
        CertificateResult::from_chain(request.private_key_pem, full_chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeClient, ChallengeStatus, ChallengeType};
    use crate::cert::load_leaf_certificate;
    use crate::testing::self_signed_certificate;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.entries.lock().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().clone()
        }
    }

    struct FakeFactory {
        journal: Arc<Journal>,
        authorizations: Vec<Authorization>,
        poll_status: AuthorizationStatus,
        chain: String,
    }

    #[async_trait]
    impl AcmeClientFactory for FakeFactory {
        async fn create(&self, account_email: &str) -> anyhow::Result<Box<dyn AcmeClient>> {
            self.journal.push(format!("client {account_email}"));
            Ok(Box::new(FakeClient {
                journal: self.journal.clone(),
                authorizations: self.authorizations.clone(),
                poll_status: self.poll_status,
                chain: self.chain.clone(),
            }))
        }
    }

    struct FakeClient {
        journal: Arc<Journal>,
        authorizations: Vec<Authorization>,
        poll_status: AuthorizationStatus,
        chain: String,
    }

    #[async_trait]
    impl AcmeClient for FakeClient {
        async fn new_order(&self, identifiers: &[Identifier]) -> anyhow::Result<Box<dyn AcmeOrder>> {
            self.journal
                .push(format!("order {}", identifiers.iter().join(",")));
            Ok(Box::new(FakeOrder {
                journal: self.journal.clone(),
                authorizations: self.authorizations.clone(),
                poll_status: self.poll_status,
                chain: self.chain.clone(),
            }))
        }
    }

    struct FakeOrder {
        journal: Arc<Journal>,
        authorizations: Vec<Authorization>,
        poll_status: AuthorizationStatus,
        chain: String,
    }

    #[async_trait]
    impl AcmeOrder for FakeOrder {
        async fn authorizations(&mut self) -> anyhow::Result<Vec<Authorization>> {
            Ok(self.authorizations.clone())
        }

        fn key_authorization(&self, challenge: &Challenge) -> String {
            format!("{}.thumbprint", challenge.token)
        }

        async fn set_challenge_ready(&mut self, challenge: &Challenge) -> anyhow::Result<()> {
            self.journal.push(format!("ready {}", challenge.token));
            Ok(())
        }

        async fn poll_authorization(
            &mut self,
            identifier: &Identifier,
        ) -> anyhow::Result<Authorization> {
            let mut authz = self
                .authorizations
                .iter()
                .find(|authz| authz.identifier == *identifier)
                .cloned()
                .context("unknown identifier")?;
            authz.status = self.poll_status;
            Ok(authz)
        }

        async fn finalize(&mut self, csr_der: &[u8]) -> anyhow::Result<String> {
            assert!(!csr_der.is_empty());
            self.journal.push("finalize");
            Ok(self.chain.clone())
        }
    }

    struct RecordingHandler {
        journal: Arc<Journal>,
        accept: bool,
    }

    #[async_trait]
    impl ChallengeHandler for RecordingHandler {
        fn types(&self) -> Vec<ChallengeType> {
            vec![ChallengeType::Dns01, ChallengeType::Http01]
        }

        async fn create(
            &self,
            authz: &Authorization,
            challenge: &Challenge,
            key_authorization: &str,
        ) -> anyhow::Result<bool> {
            self.journal.push(format!(
                "create {} {} {key_authorization}",
                authz.identifier, challenge.challenge_type
            ));
            Ok(self.accept)
        }

        async fn remove(
            &self,
            authz: &Authorization,
            _challenge: &Challenge,
            _key_authorization: &str,
        ) -> anyhow::Result<bool> {
            self.journal.push(format!("remove {}", authz.identifier));
            Err(anyhow::anyhow!("cleanup is flaky"))
        }
    }

    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChallengeVerifier for CountingVerifier {
        async fn verify(&self, _: &Authorization, _: &Challenge, _: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn authorization(domain: &str, status: AuthorizationStatus) -> Authorization {
        let challenge = |challenge_type, suffix: &str| Challenge {
            challenge_type,
            token: format!("{domain}-{suffix}"),
            url: format!("https://ca.invalid/chall/{domain}/{suffix}"),
            status: ChallengeStatus::Pending,
            validated: None,
            error: None,
        };
        Authorization {
            identifier: Identifier::from(domain),
            status,
            challenges: vec![
                challenge(ChallengeType::Http01, "http"),
                challenge(ChallengeType::Dns01, "dns"),
            ],
            expires: None,
            wildcard: false,
        }
    }

    struct Fixture {
        journal: Arc<Journal>,
        verifier: Arc<CountingVerifier>,
        generator: AcmeCertificateGenerator,
        chain: String,
    }

    fn fixture(
        authorizations: Vec<Authorization>,
        poll_status: AuthorizationStatus,
        accept: bool,
        options: GeneratorOptions,
    ) -> anyhow::Result<Fixture> {
        let not_after = OffsetDateTime::now_utc() + time::Duration::days(90);
        let leaf = self_signed_certificate("example.com", not_after)?;
        let root = self_signed_certificate("root.example", not_after)?;
        let chain = format!("{}{}", leaf.certificate, root.certificate);
        let journal = Arc::new(Journal::default());
        let verifier = Arc::new(CountingVerifier::default());
        let generator = AcmeCertificateGenerator::new(
            Arc::new(FakeFactory {
                journal: journal.clone(),
                authorizations,
                poll_status,
                chain: chain.clone(),
            }),
            Arc::new(RecordingHandler {
                journal: journal.clone(),
                accept,
            }),
            verifier.clone(),
            options,
        );
        Ok(Fixture {
            journal,
            verifier,
            generator,
            chain,
        })
    }

    #[tokio::test]
    async fn test_generate_full_flow() -> anyhow::Result<()> {
        let fixture = fixture(
            vec![
                authorization("example.com", AuthorizationStatus::Pending),
                authorization("www.example.com", AuthorizationStatus::Valid),
            ],
            AuthorizationStatus::Valid,
            true,
            GeneratorOptions::default(),
        )?;
        let options = CsrOptions {
            alt_names: vec!["www.example.com".to_string()],
            ..CsrOptions::new("example.com")
        };

        let result = fixture
            .generator
            .generate(&options, "me@example.com")
            .await?;

        assert_eq!(
            fixture.journal.entries(),
            vec![
                "client me@example.com",
                "order example.com,www.example.com",
                "create example.com dns-01 example.com-dns.thumbprint",
                "ready example.com-dns",
                "remove example.com",
                "finalize",
            ]
        );
        assert_eq!(fixture.verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.certificate, fixture.chain);
        assert!(result.private_key.contains("PRIVATE KEY"));
        let ca = load_leaf_certificate(&result.ca_cert)?;
        assert_eq!(ca.dns_names, vec!["root.example".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_challenge_verification() -> anyhow::Result<()> {
        let fixture = fixture(
            vec![authorization("example.com", AuthorizationStatus::Pending)],
            AuthorizationStatus::Valid,
            true,
            GeneratorOptions {
                skip_challenge_verification: true,
            },
        )?;

        fixture
            .generator
            .generate(&CsrOptions::new("example.com"), "me@example.com")
            .await?;

        assert_eq!(fixture.verifier.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_authorization_still_cleans_up() -> anyhow::Result<()> {
        let fixture = fixture(
            vec![authorization("example.com", AuthorizationStatus::Pending)],
            AuthorizationStatus::Invalid,
            true,
            GeneratorOptions::default(),
        )?;

        let result = fixture
            .generator
            .generate(&CsrOptions::new("example.com"), "me@example.com")
            .await;

        assert!(result.is_err());
        let entries = fixture.journal.entries();
        assert!(entries.contains(&"remove example.com".to_string()));
        assert!(!entries.contains(&"finalize".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_declined_challenge_fails() -> anyhow::Result<()> {
        let fixture = fixture(
            vec![authorization("example.com", AuthorizationStatus::Pending)],
            AuthorizationStatus::Valid,
            false,
            GeneratorOptions::default(),
        )?;

        let result = fixture
            .generator
            .generate(&CsrOptions::new("example.com"), "me@example.com")
            .await;

        assert!(result.is_err());
        let entries = fixture.journal.entries();
        assert!(!entries.contains(&"ready example.com-dns".to_string()));
        assert!(entries.contains(&"remove example.com".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_unexpected_authorization_status() -> anyhow::Result<()> {
        let fixture = fixture(
            vec![authorization("example.com", AuthorizationStatus::Deactivated)],
            AuthorizationStatus::Valid,
            true,
            GeneratorOptions::default(),
        )?;

        let result = fixture
            .generator
            .generate(&CsrOptions::new("example.com"), "me@example.com")
            .await;

        assert!(result.is_err());
        assert_eq!(
            fixture.journal.entries(),
            vec!["client me@example.com", "order example.com"]
        );
        Ok(())
    }
}
