use crate::CRATE_NAME;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("{0} is not a directory")]
    PathNotDirectory(PathBuf),
    #[error("{0} is not writable")]
    PathNotWritable(PathBuf),
    #[error("{0} does not exist")]
    PathNotFound(PathBuf),
}

/// A filesystem path in which every `%s` is substituted with a domain name,
/// e.g. `/etc/nginx/certs/%s.crt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn resolve(&self, common_name: &str) -> PathBuf {
        PathBuf::from(self.0.replace("%s", common_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PathTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl From<String> for PathTemplate {
    fn from(template: String) -> Self {
        Self::new(template)
    }
}

impl Display for PathTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ensure `path` is an existing, writable directory. Missing directories are created if `create`
/// is set, otherwise they are reported as [`PathError::PathNotFound`].
pub async fn ensure_directory(path: &Path, create: bool) -> anyhow::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(PathError::PathNotDirectory(path.to_path_buf()).into()),
        Err(e) if e.kind() == ErrorKind::NotFound && create => {
            tokio::fs::create_dir_all(path)
                .await
                .context(format!("Creating directory {} failed", path.display()))?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PathError::PathNotFound(path.to_path_buf()).into());
        }
        Err(e) => {
            return Err(e).context(format!("Inspecting {} failed", path.display()));
        }
    }
    ensure_directory_writable(path).await
}

/// Check a directory for write access by creating (and removing) a scratch file in it.
pub async fn ensure_directory_writable(path: &Path) -> anyhow::Result<()> {
    let marker = path.join(format!(".{CRATE_NAME}-write-check-{}", std::process::id()));
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&marker)
        .await
    {
        Ok(file) => {
            drop(file);
            let _ = tokio::fs::remove_file(&marker).await;
            Ok(())
        }
        Err(e) if is_permission_error(&e) => {
            Err(PathError::PathNotWritable(path.to_path_buf()).into())
        }
        Err(e) => Err(e).context(format!("Checking write access to {} failed", path.display())),
    }
}

/// Ensure an existing file may be overwritten. A missing file passes, its directory is checked
/// separately.
pub async fn ensure_file_writable(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {
            Err(PathError::PathNotWritable(path.to_path_buf()).into())
        }
        Ok(_) => match tokio::fs::OpenOptions::new().append(true).open(path).await {
            Ok(_) => Ok(()),
            Err(e) if is_permission_error(&e) => {
                Err(PathError::PathNotWritable(path.to_path_buf()).into())
            }
            Err(e) => Err(e).context(format!("Checking write access to {} failed", path.display())),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Inspecting {} failed", path.display())),
    }
}

fn is_permission_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
    )
}

/// Write `contents` to a temporary sibling of `path` and rename it into place, so readers never
/// observe a half-written file. `private` restricts the file to its owner on unix.
pub async fn write_atomically(path: &Path, contents: &[u8], private: bool) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;
    let mut file = options
        .open(&temp_path)
        .await
        .context(format!("Opening {} for writing failed", temp_path.display()))?;
    file.write_all(contents)
        .await
        .context(format!("Writing {} failed", temp_path.display()))?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await.context(format!(
        "Moving {} to {} failed",
        temp_path.display(),
        path.display()
    ))?;
    Ok(())
}

/// Compute the path of `target` relative to the directory `base`. Both are made absolute
/// against the working directory first; symlinks are not resolved.
pub fn relative_path(base: &Path, target: &Path) -> std::io::Result<PathBuf> {
    let base = std::path::absolute(base)?;
    let target = std::path::absolute(target)?;
    let base_components: Vec<Component> = base.components().collect();
    let target_components: Vec<Component> = target.components().collect();
    let common = base_components
        .iter()
        .zip(&target_components)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    Ok(relative)
}
