use crate::fs::{PathTemplate, ensure_directory, ensure_file_writable, write_atomically};
use crate::generator::CertificateResult;
use crate::store::CertStore;
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Writes certificate, key and CA certificate to three templated paths.
#[derive(Debug, Clone)]
pub struct FlatFileCertStore {
    cert: PathTemplate,
    key: PathTemplate,
    ca: PathTemplate,
}

impl FlatFileCertStore {
    pub fn new(cert: PathTemplate, key: PathTemplate, ca: PathTemplate) -> Self {
        Self { cert, key, ca }
    }

    fn paths(&self, common_name: &str) -> [std::path::PathBuf; 3] {
        [
            self.cert.resolve(common_name),
            self.key.resolve(common_name),
            self.ca.resolve(common_name),
        ]
    }
}

async fn prepare_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent, true).await?;
    }
    ensure_file_writable(path).await
}

#[async_trait]
impl CertStore for FlatFileCertStore {
    async fn prepare(&self, common_name: &str) -> anyhow::Result<()> {
        for path in self.paths(common_name) {
            prepare_file(&path)
                .await
                .context(format!("Cannot store certificates at {}", path.display()))?;
        }
        Ok(())
    }

    async fn has_cert(&self, common_name: &str) -> anyhow::Result<bool> {
        let path = self.cert.resolve(common_name);
        tokio::fs::try_exists(&path)
            .await
            .context(format!("Inspecting {} failed", path.display()))
    }

    async fn get_cert(&self, common_name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.cert.resolve(common_name);
        tokio::fs::read(&path)
            .await
            .context(format!("Reading certificate {} failed", path.display()))
    }

    async fn store(&self, common_name: &str, result: &CertificateResult) -> anyhow::Result<()> {
        let [cert, key, ca] = self.paths(common_name);
        write_atomically(&cert, result.certificate.as_bytes(), false).await?;
        write_atomically(&key, result.private_key.as_bytes(), true).await?;
        write_atomically(&ca, result.ca_cert.as_bytes(), false).await?;
        debug!(
            "Stored certificate for {common_name} at {}, key at {}, CA at {}",
            cert.display(),
            key.display(),
            ca.display()
        );
        Ok(())
    }
}
