use crate::fs::{PathTemplate, ensure_directory, ensure_file_writable, relative_path, write_atomically};
use crate::generator::CertificateResult;
use crate::store::CertStore;
use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CERT_FILE_NAME: &str = "fullchain.pem";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const CA_FILE_NAME: &str = "chain.pem";

/// A DH parameter file shared by all domains, linked per domain.
#[derive(Debug, Clone)]
pub struct DhParams {
    pub file: PathBuf,
    pub link: PathTemplate,
}

/// Keeps the real files in a per-domain directory and points configurable symlinks at them,
/// the layout web servers such as nginx are usually configured for.
#[derive(Debug, Clone)]
pub struct SymlinkCertStore {
    store_dir: PathTemplate,
    cert_link: PathTemplate,
    key_link: PathTemplate,
    ca_link: PathTemplate,
    dhparam: Option<DhParams>,
}

struct Layout {
    store_dir: PathBuf,
    /// Real file and link, for certificate, key and CA certificate.
    files: [(PathBuf, PathBuf); 3],
}

impl SymlinkCertStore {
    pub fn new(
        store_dir: PathTemplate,
        cert_link: PathTemplate,
        key_link: PathTemplate,
        ca_link: PathTemplate,
        dhparam: Option<DhParams>,
    ) -> Self {
        Self {
            store_dir,
            cert_link,
            key_link,
            ca_link,
            dhparam,
        }
    }

    fn layout(&self, common_name: &str) -> Layout {
        let store_dir = self.store_dir.resolve(common_name);
        let files = [
            (store_dir.join(CERT_FILE_NAME), self.cert_link.resolve(common_name)),
            (store_dir.join(KEY_FILE_NAME), self.key_link.resolve(common_name)),
            (store_dir.join(CA_FILE_NAME), self.ca_link.resolve(common_name)),
        ];
        Layout { store_dir, files }
    }

    async fn link_dhparam(&self, common_name: &str) -> anyhow::Result<()> {
        if let Some(dhparam) = &self.dhparam {
            if is_file(&dhparam.file).await? {
                symlink(&dhparam.file, &dhparam.link.resolve(common_name)).await?;
            } else {
                debug!(
                    "DH parameters {} not found, not linking them for {common_name}",
                    dhparam.file.display()
                );
            }
        }
        Ok(())
    }
}

async fn is_file(path: &Path) -> anyhow::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("Inspecting {} failed", path.display())),
    }
}

fn link_parent(link: &Path) -> &Path {
    link.parent().unwrap_or(Path::new("."))
}

/// Point `link` at `target` using a path relative to the link's directory. A correct link is
/// left alone; anything else at `link` is replaced.
async fn symlink(target: &Path, link: &Path) -> anyhow::Result<()> {
    let relative_target = relative_path(link_parent(link), target)
        .context(format!("Resolving link target {} failed", target.display()))?;
    match tokio::fs::symlink_metadata(link).await {
        Ok(metadata) => {
            if metadata.file_type().is_symlink()
                && tokio::fs::read_link(link).await? == relative_target
            {
                return Ok(());
            }
            info!("Removing bad file at {}", link.display());
            tokio::fs::remove_file(link)
                .await
                .context(format!("Removing {} failed", link.display()))?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).context(format!("Inspecting {} failed", link.display())),
    }
    info!(
        "Creating symlink {} => {}",
        link.display(),
        relative_target.display()
    );
    #[cfg(unix)]
    let created = tokio::fs::symlink(&relative_target, link).await;
    #[cfg(windows)]
    let created = tokio::fs::symlink_file(&relative_target, link).await;
    created.context(format!(
        "Error creating symlink {} => {}",
        link.display(),
        relative_target.display()
    ))
}

#[async_trait]
impl CertStore for SymlinkCertStore {
    async fn prepare(&self, common_name: &str) -> anyhow::Result<()> {
        let layout = self.layout(common_name);
        ensure_directory(&layout.store_dir, true).await.context(format!(
            "Cannot use certificate directory {}",
            layout.store_dir.display()
        ))?;
        for (_, link) in &layout.files {
            ensure_directory(link_parent(link), true).await?;
            ensure_file_writable(link).await?;
        }

        // Repair links for an existing certificate
        for (real, link) in &layout.files {
            if is_file(real).await? {
                symlink(real, link).await?;
            }
        }
        if let Some(dhparam) = &self.dhparam {
            ensure_directory(link_parent(&dhparam.link.resolve(common_name)), true).await?;
        }
        self.link_dhparam(common_name).await
    }

    async fn has_cert(&self, common_name: &str) -> anyhow::Result<bool> {
        let layout = self.layout(common_name);
        let (real, link) = &layout.files[0];
        // try_exists follows the link, so a dangling link counts as missing
        Ok(tokio::fs::try_exists(link).await? && is_file(real).await?)
    }

    async fn get_cert(&self, common_name: &str) -> anyhow::Result<Vec<u8>> {
        let layout = self.layout(common_name);
        let (real, _) = &layout.files[0];
        tokio::fs::read(real)
            .await
            .context(format!("Reading certificate {} failed", real.display()))
    }

    async fn store(&self, common_name: &str, result: &CertificateResult) -> anyhow::Result<()> {
        let layout = self.layout(common_name);
        tokio::fs::create_dir_all(&layout.store_dir)
            .await
            .context(format!("Creating {} failed", layout.store_dir.display()))?;
        let contents = [
            (result.certificate.as_bytes(), false),
            (result.private_key.as_bytes(), true),
            (result.ca_cert.as_bytes(), false),
        ];
        for ((real, link), (content, private)) in layout.files.iter().zip(contents) {
            write_atomically(real, content, private).await?;
            symlink(real, link).await?;
        }
        self.link_dhparam(common_name).await?;
        debug!(
            "Stored certificate for {common_name} in {}",
            layout.store_dir.display()
        );
        Ok(())
    }
}
