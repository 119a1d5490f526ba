use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::handler::DEFAULT_EXPIRY_THRESHOLD_DAYS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

mod default;
mod toml;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/certkeeper/config.toml";
pub const DEFAULT_CHECK_FREQUENCY_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Use the Let's Encrypt staging directory instead of production.
    #[serde(default)]
    pub staging: bool,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub skip_challenge_verification: bool,
    #[serde(default = "default_expiry_threshold_days")]
    pub expiry_threshold_days: u32,
    #[serde(default = "default_check_frequency_minutes")]
    pub check_frequency_minutes: u64,
    /// Without a directory, every client registers a fresh ACME account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key_dir: Option<PathBuf>,
    pub store: StoreConfiguration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solvers: Vec<SolverConfiguration>,
    /// Domain to account email.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfiguration {
    Flat {
        cert: String,
        key: String,
        ca: String,
    },
    Symlink {
        store_dir: String,
        cert_link: String,
        key_link: String,
        ca_link: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dhparam: Option<DhParamConfiguration>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhParamConfiguration {
    pub file: PathBuf,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SolverConfiguration {
    Webroot {
        webroot: PathBuf,
    },
    Cloudflare {
        api_token: String,
        zone_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_url: Option<Url>,
    },
}

fn default_expiry_threshold_days() -> u32 {
    DEFAULT_EXPIRY_THRESHOLD_DAYS
}

fn default_check_frequency_minutes() -> u64 {
    DEFAULT_CHECK_FREQUENCY_MINUTES
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

/// Load the configuration at `file`, writing the defaults there first if it does not exist.
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    if file.as_ref().exists() {
        TomlConfiguration::load(file)
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        Ok(default)
    }
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("nested/config.toml");

        let config = load(&file)?;

        assert!(file.exists());
        assert_eq!(config, DefaultConfig::default().get_config());
        assert_eq!(load(&file)?, config);
        Ok(())
    }

    #[test]
    fn test_minimal_file_uses_field_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("config.toml");
        std::fs::write(
            &file,
            r#"
[store]
type = "flat"
cert = "/certs/%s.crt"
key = "/certs/%s.key"
ca = "/certs/%s.chain.pem"

[domains]
"example.com" = "me@example.com"
"#,
        )?;

        let config = load(&file)?;

        assert!(!config.staging);
        assert!(!config.terms_of_service_agreed);
        assert_eq!(config.expiry_threshold_days, 30);
        assert_eq!(config.check_frequency_minutes, 1440);
        assert_eq!(config.account_key_dir, None);
        assert!(config.solvers.is_empty());
        assert_eq!(
            config.store,
            StoreConfiguration::Flat {
                cert: "/certs/%s.crt".to_string(),
                key: "/certs/%s.key".to_string(),
                ca: "/certs/%s.chain.pem".to_string(),
            }
        );
        assert_eq!(
            config.domains.get("example.com").map(String::as_str),
            Some("me@example.com")
        );
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("config.toml");
        let mut config = DefaultConfig::default().get_config();
        config.staging = true;
        config.terms_of_service_agreed = true;
        config.solvers.push(SolverConfiguration::Cloudflare {
            api_token: "token".to_string(),
            zone_id: "zone".to_string(),
            api_url: None,
        });
        config
            .domains
            .insert("example.com".to_string(), "me@example.com".to_string());

        save(&config, &file)?;
        let written = std::fs::read_to_string(&file)?;

        assert!(written.contains("zone_id = \"zone\""), "{written}");
        assert_eq!(load(&file)?, config);
        Ok(())
    }
}
