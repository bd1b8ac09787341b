//! On-disk payload tier.
//!
//! Layout: `<root>/layer-<id>/<sha256(key)>.json`. Each file is one JSON header line
//! followed by the raw payload bytes. Files are written to a temporary sibling and
//! renamed into place, so readers never observe partial payloads.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use super::{
    keys::CacheKey,
    payload::{CachedPayload, PayloadMeta},
};
use crate::{domain::layer::LayerId, source::Fingerprint};

const LAYER_DIR_PREFIX: &str = "layer-";

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("cache write to `{path}` failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache header encoding failed: {0}")]
    Header(#[from] serde_json::Error),
    #[error("cache write task failed: {0}")]
    Task(String),
}

impl CacheWriteError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskHeader {
    key: String,
    fingerprint: Fingerprint,
    meta: PayloadMeta,
}

#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
    enabled: bool,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            root: root.into(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, layer_id: LayerId) -> PathBuf {
        self.root.join(format!("{LAYER_DIR_PREFIX}{layer_id}"))
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.layer_dir(key.layer_id)
            .join(format!("{}.json", key.digest()))
    }

    /// Read a payload; unreadable or foreign files count as misses.
    pub async fn read(&self, key: &CacheKey) -> Option<CachedPayload> {
        if !self.enabled {
            return None;
        }

        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read cached payload");
                return None;
            }
        };

        let Some(split) = raw.iter().position(|byte| *byte == b'\n') else {
            warn!(path = %path.display(), "Cached payload has no header");
            return None;
        };
        let header: DiskHeader = match serde_json::from_slice(&raw[..split]) {
            Ok(header) => header,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Cached payload header unreadable");
                return None;
            }
        };
        if header.key != key.canonical() {
            debug!(path = %path.display(), stored = %header.key, "Cached payload belongs to another key");
            return None;
        }

        let mut raw = Bytes::from(raw);
        let body = raw.split_off(split + 1);
        Some(CachedPayload {
            body,
            meta: header.meta,
            fingerprint: header.fingerprint,
        })
    }

    /// Persist a payload atomically.
    pub async fn write(&self, key: &CacheKey, payload: &CachedPayload) -> Result<(), CacheWriteError> {
        if !self.enabled {
            return Ok(());
        }

        let header = serde_json::to_vec(&DiskHeader {
            key: key.canonical(),
            fingerprint: payload.fingerprint.clone(),
            meta: payload.meta.clone(),
        })?;
        let dir = self.layer_dir(key.layer_id);
        let target = self.path_for(key);
        let body = payload.body.clone();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &header, &body))
            .await
            .map_err(|err| CacheWriteError::Task(err.to_string()))?
    }

    pub async fn remove(&self, key: &CacheKey) {
        if !self.enabled {
            return;
        }
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to remove cached payload");
            }
        }
    }

    /// Remove every payload of one layer.
    pub async fn remove_layer(&self, layer_id: LayerId) -> std::io::Result<()> {
        remove_dir_if_present(&self.layer_dir(layer_id)).await
    }

    /// Remove every layer directory under the root.
    pub async fn clear(&self) -> std::io::Result<()> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let is_layer_dir = entry
                .file_name()
                .to_string_lossy()
                .starts_with(LAYER_DIR_PREFIX);
            if is_layer_dir {
                remove_dir_if_present(&entry.path()).await?;
            }
        }
        Ok(())
    }
}

async fn remove_dir_if_present(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn write_atomic(dir: &Path, target: &Path, header: &[u8], body: &[u8]) -> Result<(), CacheWriteError> {
    std::fs::create_dir_all(dir).map_err(|err| CacheWriteError::io(dir, err))?;

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|err| CacheWriteError::io(dir, err))?;
    file.write_all(header)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.write_all(body))
        .and_then(|_| file.flush())
        .map_err(|err| CacheWriteError::io(target, err))?;
    file.persist(target)
        .map_err(|err| CacheWriteError::io(target, err.error))?;
    Ok(())
}
