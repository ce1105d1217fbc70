//! Image store: resolve image names to bytes from persistent storage.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};

use crate::error::{LinkError, Result};

/// Something that can turn an image name into image bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Bytes>;
}

/// Images stored as files under one root directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    /// `~` and `~/...` are expanded against the home directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: expand_tilde(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the regular files directly under the root, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl ImageSource for DirSource {
    async fn resolve(&self, name: &str) -> Result<Bytes> {
        let path = validate_name(&self.root, name)?;
        tracing::debug!(name, path = %path.display(), "resolving image");
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| LinkError::ReadFile { path, source })?;
        Ok(Bytes::from(data))
    }
}

fn invalid(name: &str, reason: &'static str) -> LinkError {
    LinkError::InvalidImageName {
        name: name.to_string(),
        reason,
    }
}

/// Map an image name to a path under `root`, refusing anything that could
/// point outside it.
fn validate_name(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(invalid(name, "empty name"));
    }

    let rel = Path::new(name);
    if rel.is_absolute() {
        return Err(invalid(name, "absolute paths not allowed"));
    }

    for component in rel.components() {
        match component {
            Component::ParentDir => return Err(invalid(name, "path traversal not allowed")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(invalid(name, "absolute paths not allowed"))
            }
            _ => {}
        }
    }

    let full = root.join(rel);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(invalid(name, "escapes the image store"));
    }
    Ok(full)
}

/// Normalize without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    match (s, dirs::home_dir()) {
        ("~", Some(home)) => home,
        (s, Some(home)) if s.starts_with("~/") => home.join(&s[2..]),
        _ => path.to_path_buf(),
    }
}
