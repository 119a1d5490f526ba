//! Wiring of account keys, ACME client, challenge handlers, store and handler into a ready
//! [`CertMonitor`].

use crate::account::{AccountKeyGenerator, AccountKeyProvider, account_key_provider};
use crate::acme::verify::SelfVerifier;
use crate::acme::{AcmeDirectory, InstantAcmeClientFactory};
use crate::challenge::cloudflare::{CLOUDFLARE_API_URL, CloudflareApi, http_client};
use crate::challenge::dns::DnsChallengeHandler;
use crate::challenge::webroot::WebrootChallengeHandler;
use crate::challenge::{ChallengeDispatcher, ChallengeHandler};
use crate::config::{Configuration, SolverConfiguration, StoreConfiguration};
use crate::fs::PathTemplate;
use crate::generator::{AcmeCertificateGenerator, GeneratorOptions};
use crate::handler::{CertHandler, DEFAULT_EXPIRY_THRESHOLD_DAYS};
use crate::monitor::CertMonitor;
use crate::store::{CertStore, DhParams, FlatFileCertStore, SymlinkCertStore};
use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Paths of a stock nginx installation.
pub mod nginx {
    pub const ACCOUNT_KEY_DIR: &str = "/etc/letsencrypt/accounts";
    pub const WEBROOT: &str = "/usr/share/nginx/html";
    pub const STORE_DIR: &str = "/etc/nginx/certs/%s";
    pub const CERT_LINK: &str = "/etc/nginx/certs/%s.crt";
    pub const KEY_LINK: &str = "/etc/nginx/certs/%s.key";
    pub const CA_LINK: &str = "/etc/nginx/certs/%s.chain.pem";
    pub const DHPARAM_FILE: &str = "/etc/nginx/certs/dhparam.pem";
    pub const DHPARAM_LINK: &str = "/etc/nginx/certs/%s.dhparam.pem";
}

/// A monitor storing flat files, solving challenges with the given handlers.
pub struct BasicCertMonitorOptions {
    pub directory: AcmeDirectory,
    pub challenge_handlers: Vec<Arc<dyn ChallengeHandler>>,
    pub cert_path: PathTemplate,
    pub key_path: PathTemplate,
    pub ca_path: PathTemplate,
    pub account_key_dir: Option<PathBuf>,
    pub terms_of_service_agreed: bool,
    pub expiry_threshold_days: u32,
    pub skip_challenge_verification: bool,
}

impl BasicCertMonitorOptions {
    pub async fn create(self) -> anyhow::Result<CertMonitor> {
        let store = FlatFileCertStore::new(self.cert_path, self.key_path, self.ca_path);
        let handler = cert_handler(
            &self.directory,
            self.account_key_dir.as_deref(),
            self.terms_of_service_agreed,
            self.skip_challenge_verification,
            Arc::new(ChallengeDispatcher::new(self.challenge_handlers)),
            Arc::new(store),
            self.expiry_threshold_days,
        )
        .await?;
        Ok(CertMonitor::new(Arc::new(handler)))
    }
}

/// A monitor for nginx serving challenges from its web root, with certificates kept in a
/// per-domain directory and linked to where the server configuration expects them.
#[derive(Debug, Clone)]
pub struct NginxCertMonitorOptions {
    pub directory: AcmeDirectory,
    pub terms_of_service_agreed: bool,
    pub expiry_threshold_days: u32,
    pub skip_challenge_verification: bool,
    pub account_key_dir: PathBuf,
    pub webroot: PathBuf,
    pub store_dir: PathTemplate,
    pub cert_link: PathTemplate,
    pub key_link: PathTemplate,
    pub ca_link: PathTemplate,
    pub dhparam_file: PathBuf,
    pub dhparam_link: PathTemplate,
}

impl NginxCertMonitorOptions {
    pub fn new(terms_of_service_agreed: bool) -> Self {
        Self {
            directory: AcmeDirectory::LetsEncryptProduction,
            terms_of_service_agreed,
            expiry_threshold_days: DEFAULT_EXPIRY_THRESHOLD_DAYS,
            skip_challenge_verification: true,
            account_key_dir: PathBuf::from(nginx::ACCOUNT_KEY_DIR),
            webroot: PathBuf::from(nginx::WEBROOT),
            store_dir: nginx::STORE_DIR.into(),
            cert_link: nginx::CERT_LINK.into(),
            key_link: nginx::KEY_LINK.into(),
            ca_link: nginx::CA_LINK.into(),
            dhparam_file: PathBuf::from(nginx::DHPARAM_FILE),
            dhparam_link: nginx::DHPARAM_LINK.into(),
        }
    }

    /// Fails if the account key directory or the web root is not a writable directory.
    pub async fn create(self) -> anyhow::Result<CertMonitor> {
        let webroot = WebrootChallengeHandler::try_new(&self.webroot).await?;
        let store = SymlinkCertStore::new(
            self.store_dir,
            self.cert_link,
            self.key_link,
            self.ca_link,
            Some(DhParams {
                file: self.dhparam_file,
                link: self.dhparam_link,
            }),
        );
        let handler = cert_handler(
            &self.directory,
            Some(&self.account_key_dir),
            self.terms_of_service_agreed,
            self.skip_challenge_verification,
            Arc::new(webroot),
            Arc::new(store),
            self.expiry_threshold_days,
        )
        .await?;
        Ok(CertMonitor::new(Arc::new(handler)))
    }
}

async fn cert_handler(
    directory: &AcmeDirectory,
    account_key_dir: Option<&Path>,
    terms_of_service_agreed: bool,
    skip_challenge_verification: bool,
    challenge_handler: Arc<dyn ChallengeHandler>,
    store: Arc<dyn CertStore>,
    expiry_threshold_days: u32,
) -> anyhow::Result<CertHandler> {
    let key_generator: Arc<dyn AccountKeyProvider> = Arc::new(AccountKeyGenerator::new(
        directory.clone(),
        terms_of_service_agreed,
    ));
    let key_provider: Arc<dyn AccountKeyProvider> = match account_key_dir {
        Some(dir) => Arc::new(account_key_provider(dir, directory, Some(key_generator)).await?),
        None => key_generator,
    };
    let client_factory = Arc::new(InstantAcmeClientFactory::new(key_provider));
    let verifier = Arc::new(SelfVerifier::try_new()?);
    let generator = AcmeCertificateGenerator::new(
        client_factory,
        challenge_handler,
        verifier,
        GeneratorOptions {
            skip_challenge_verification,
        },
    );
    debug!("Using ACME directory {directory}");
    Ok(CertHandler::new(
        Arc::new(generator),
        store,
        expiry_threshold_days,
    ))
}

pub async fn challenge_handler(
    solver: &SolverConfiguration,
) -> anyhow::Result<Arc<dyn ChallengeHandler>> {
    Ok(match solver {
        SolverConfiguration::Webroot { webroot } => {
            Arc::new(WebrootChallengeHandler::try_new(webroot).await?)
        }
        SolverConfiguration::Cloudflare {
            api_token,
            zone_id,
            api_url,
        } => {
            let base_url = match api_url {
                Some(url) => url.clone(),
                None => Url::parse(CLOUDFLARE_API_URL)?,
            };
            let api = CloudflareApi::new(
                base_url,
                zone_id.clone(),
                api_token.clone(),
                http_client()?,
            );
            Arc::new(DnsChallengeHandler::new(api))
        }
    })
}

pub fn cert_store(config: &StoreConfiguration) -> Arc<dyn CertStore> {
    match config {
        StoreConfiguration::Flat { cert, key, ca } => Arc::new(FlatFileCertStore::new(
            cert.as_str().into(),
            key.as_str().into(),
            ca.as_str().into(),
        )),
        StoreConfiguration::Symlink {
            store_dir,
            cert_link,
            key_link,
            ca_link,
            dhparam,
        } => Arc::new(SymlinkCertStore::new(
            store_dir.as_str().into(),
            cert_link.as_str().into(),
            key_link.as_str().into(),
            ca_link.as_str().into(),
            dhparam.as_ref().map(|dhparam| DhParams {
                file: dhparam.file.clone(),
                link: dhparam.link.as_str().into(),
            }),
        )),
    }
}

/// Build the handler described by a configuration file.
pub async fn cert_handler_from_configuration(config: &Configuration) -> anyhow::Result<CertHandler> {
    if config.solvers.is_empty() {
        bail!("No challenge solvers are configured");
    }
    let mut handlers = Vec::with_capacity(config.solvers.len());
    for solver in &config.solvers {
        handlers.push(
            challenge_handler(solver)
                .await
                .context("Setting up challenge solver failed")?,
        );
    }
    cert_handler(
        &AcmeDirectory::from_staging_flag(config.staging),
        config.account_key_dir.as_deref(),
        config.terms_of_service_agreed,
        config.skip_challenge_verification,
        Arc::new(ChallengeDispatcher::new(handlers)),
        cert_store(&config.store),
        config.expiry_threshold_days,
    )
    .await
}

/// Build a monitor watching the configured domains.
pub async fn monitor_from_configuration(config: &Configuration) -> anyhow::Result<CertMonitor> {
    let handler = cert_handler_from_configuration(config).await?;
    let monitor = CertMonitor::new(Arc::new(handler));
    monitor.set(config.domains.clone());
    Ok(monitor)
}
