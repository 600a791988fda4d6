//! Filesystem-backed [`ObjectStore`] for image attachments.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::contract::ObjectStore;
use crate::error::{Result, StoreError};

const MAX_NAME_LEN: usize = 64;

/// Resolve `target` under `base`, refusing anything that would escape it.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(StoreError::InvalidObject("Path traversal detected".into()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(StoreError::InvalidObject("Path traversal detected".into()));
    }
    Ok(resolved)
}

/// Keep `[A-Za-z0-9._-]`, replace the rest, and never start with a dot.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FsObjectStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;

        info!(path = %base_path.display(), max_size, "Object store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, file_name: &str) -> Result<PathBuf> {
        ensure_within(&self.base_path, &self.base_path.join(file_name))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidObject("Empty object".into()));
        }
        if bytes.len() > self.max_size {
            return Err(StoreError::InvalidObject(format!(
                "Object too large: {} bytes (max {})",
                bytes.len(),
                self.max_size
            )));
        }

        let file_name = format!("{}-{}", Uuid::new_v4(), sanitize_name(suggested_name));
        let path = self.object_path(&file_name)?;

        fs::write(&path, &bytes).await?;

        debug!(file = %file_name, size = bytes.len(), "Stored object");
        Ok(format!("file://{}", path.display()))
    }
}
