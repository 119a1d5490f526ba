//! ACME account keys.
//!
//! An account key is the serialized `instant-acme` credential set of a registered account. It
//! is opaque to everything except [`crate::acme::InstantAcmeClientFactory`]. Keys are looked up
//! by account email; the empty email maps to the identity `default`.

use crate::acme::AcmeDirectory;
use crate::fs::{ensure_directory, write_atomically};
use anyhow::Context;
use async_trait::async_trait;
use instant_acme::{Account, NewAccount};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_IDENTITY: &str = "default";
const KEY_FILE_EXTENSION: &str = "key";

#[derive(Debug, thiserror::Error)]
pub enum AccountKeyError {
    #[error("Missing account key for '{0}'")]
    MissingAccountKey(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey(Vec<u8>);

impl AccountKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for AccountKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Debug for AccountKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountKey(<{} bytes>)", self.0.len())
    }
}

#[async_trait]
pub trait AccountKeyProvider: Send + Sync {
    async fn account_key(&self, account_email: &str) -> anyhow::Result<AccountKey>;
}

/// Registers a fresh ACME account on every call.
pub struct AccountKeyGenerator {
    directory: AcmeDirectory,
    terms_of_service_agreed: bool,
}

impl AccountKeyGenerator {
    pub fn new(directory: AcmeDirectory, terms_of_service_agreed: bool) -> Self {
        Self {
            directory,
            terms_of_service_agreed,
        }
    }
}

#[async_trait]
impl AccountKeyProvider for AccountKeyGenerator {
    async fn account_key(&self, account_email: &str) -> anyhow::Result<AccountKey> {
        let contact = format!("mailto:{account_email}");
        let contacts = if account_email.is_empty() {
            Vec::new()
        } else {
            vec![contact.as_str()]
        };
        let new_account = NewAccount {
            contact: &contacts,
            terms_of_service_agreed: self.terms_of_service_agreed,
            only_return_existing: false,
        };
        let (_account, credentials) = Account::create(&new_account, self.directory.url(), None)
            .await
            .context(format!(
                "Registering ACME account for '{account_email}' at {} failed",
                self.directory
            ))?;
        info!("Registered new ACME account for '{account_email}' at {}", self.directory);
        let serialized =
            serde_json::to_vec(&credentials).context("Serializing account credentials failed")?;
        Ok(AccountKey(serialized))
    }
}

/// Persistent storage for account keys.
#[async_trait]
pub trait AccountKeyStore: Send + Sync {
    async fn has_key(&self, account_email: &str) -> anyhow::Result<bool>;

    async fn get_key(&self, account_email: &str) -> anyhow::Result<AccountKey>;

    async fn store_key(&self, account_email: &str, key: &AccountKey) -> anyhow::Result<()>;
}

/// Stores one key file per identity in a directory. Key files are readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileSystemKeyStore {
    directory: PathBuf,
}

impl FileSystemKeyStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn key_path(&self, account_email: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{KEY_FILE_EXTENSION}", key_file_stem(account_email)))
    }
}

/// Escape an email into a file name: everything but ASCII letters, digits and `@` becomes `_`.
fn key_file_stem(account_email: &str) -> String {
    if account_email.is_empty() {
        return DEFAULT_IDENTITY.to_string();
    }
    account_email
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '@' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl AccountKeyStore for FileSystemKeyStore {
    async fn has_key(&self, account_email: &str) -> anyhow::Result<bool> {
        let path = self.key_path(account_email);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(format!("Inspecting {} failed", path.display())),
        }
    }

    async fn get_key(&self, account_email: &str) -> anyhow::Result<AccountKey> {
        if !self.has_key(account_email).await? {
            return Err(AccountKeyError::MissingAccountKey(account_email.to_string()).into());
        }
        let path = self.key_path(account_email);
        let bytes = tokio::fs::read(&path)
            .await
            .context(format!("Reading account key {} failed", path.display()))?;
        Ok(AccountKey(bytes))
    }

    async fn store_key(&self, account_email: &str, key: &AccountKey) -> anyhow::Result<()> {
        let path = self.key_path(account_email);
        write_atomically(&path, key.as_bytes(), true).await?;
        debug!("Stored account key for '{account_email}' at {}", path.display());
        Ok(())
    }
}

/// Reads keys from a store, generating and persisting missing ones when a generator is present.
pub struct StoredAccountKeyProvider<S> {
    store: S,
    generator: Option<Arc<dyn AccountKeyProvider>>,
    // Serializes generation so concurrent requests for one identity register a single account
    generation: tokio::sync::Mutex<()>,
}

impl<S: AccountKeyStore> StoredAccountKeyProvider<S> {
    pub fn new(store: S, generator: Option<Arc<dyn AccountKeyProvider>>) -> Self {
        Self {
            store,
            generator,
            generation: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl<S: AccountKeyStore> AccountKeyProvider for StoredAccountKeyProvider<S> {
    async fn account_key(&self, account_email: &str) -> anyhow::Result<AccountKey> {
        if !self.store.has_key(account_email).await? {
            let Some(generator) = &self.generator else {
                return Err(AccountKeyError::MissingAccountKey(account_email.to_string()).into());
            };
            let _generation = self.generation.lock().await;
            if !self.store.has_key(account_email).await? {
                let key = generator.account_key(account_email).await?;
                self.store.store_key(account_email, &key).await?;
            }
        }
        self.store.get_key(account_email).await
    }
}

/// A provider keeping its keys below `directory`, which must be an existing, writable
/// directory. Keys live in a subdirectory per ACME server, so switching between servers never
/// reuses an account registered elsewhere.
pub async fn account_key_provider(
    directory: &Path,
    acme_directory: &AcmeDirectory,
    generator: Option<Arc<dyn AccountKeyProvider>>,
) -> anyhow::Result<StoredAccountKeyProvider<FileSystemKeyStore>> {
    ensure_directory(directory, false)
        .await
        .context(format!("Account key directory {} is unusable", directory.display()))?;
    let key_directory = directory.join(acme_directory.storage_name());
    ensure_directory(&key_directory, true).await.context(format!(
        "Account key directory {} is unusable",
        key_directory.display()
    ))?;
    Ok(StoredAccountKeyProvider::new(
        FileSystemKeyStore::new(key_directory),
        generator,
    ))
}
