use crate::generator::CertificateResult;
use async_trait::async_trait;

pub mod flat;
pub mod symlink;

pub use flat::FlatFileCertStore;
pub use symlink::{DhParams, SymlinkCertStore};

/// Where issued certificates live, addressed by common name.
#[async_trait]
pub trait CertStore: Send + Sync {
    /// Make sure the store can hold a certificate for `common_name`, creating directories and
    /// repairing the layout as needed. Called before every other operation.
    async fn prepare(&self, common_name: &str) -> anyhow::Result<()>;

    async fn has_cert(&self, common_name: &str) -> anyhow::Result<bool>;

    /// The stored full chain (PEM), leaf first.
    async fn get_cert(&self, common_name: &str) -> anyhow::Result<Vec<u8>>;

    async fn store(&self, common_name: &str, result: &CertificateResult) -> anyhow::Result<()>;
}
