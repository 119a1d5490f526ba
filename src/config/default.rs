use crate::config::{
    ConfigBackend, Configuration, DEFAULT_CHECK_FREQUENCY_MINUTES, DhParamConfiguration,
    SolverConfiguration, StoreConfiguration,
};
use crate::factory::nginx;
use crate::handler::DEFAULT_EXPIRY_THRESHOLD_DAYS;
use anyhow::{Error, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The layout of a stock nginx installation serving ACME challenges from its web root.
#[derive(Debug, Clone, Default)]
pub struct DefaultConfig {}

impl DefaultConfig {
    pub fn get_config(&self) -> Configuration {
        Configuration {
            staging: false,
            terms_of_service_agreed: false,
            skip_challenge_verification: true,
            expiry_threshold_days: DEFAULT_EXPIRY_THRESHOLD_DAYS,
            check_frequency_minutes: DEFAULT_CHECK_FREQUENCY_MINUTES,
            account_key_dir: Some(PathBuf::from(nginx::ACCOUNT_KEY_DIR)),
            store: StoreConfiguration::Symlink {
                store_dir: nginx::STORE_DIR.to_string(),
                cert_link: nginx::CERT_LINK.to_string(),
                key_link: nginx::KEY_LINK.to_string(),
                ca_link: nginx::CA_LINK.to_string(),
                dhparam: Some(DhParamConfiguration {
                    file: PathBuf::from(nginx::DHPARAM_FILE),
                    link: nginx::DHPARAM_LINK.to_string(),
                }),
            },
            solvers: vec![SolverConfiguration::Webroot {
                webroot: PathBuf::from(nginx::WEBROOT),
            }],
            domains: BTreeMap::new(),
        }
    }
}

impl ConfigBackend for DefaultConfig {
    fn load<P: AsRef<Path>>(_file: P) -> Result<Configuration, Error> {
        Ok(Self::default().get_config())
    }

    fn save<P: AsRef<Path>>(_config: &Configuration, _file: P) -> Result<(), Error> {
        bail!("The default configuration cannot be saved")
    }
}
