//! Source fingerprints used to detect stale cache entries.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{SourceError, shapefile::companion};

const SHAPEFILE_COMPANIONS: [&str; 4] = ["shx", "dbf", "prj", "cpg"];

/// Hex SHA-256 over the name, size and modification time of every file a source reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, enough to name staging directories.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub fn fingerprint_source(path: &Path) -> Result<Fingerprint, SourceError> {
    let mut files: Vec<PathBuf> = vec![path.to_path_buf()];
    let is_shp = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("shp"));
    if is_shp {
        files.extend(
            SHAPEFILE_COMPANIONS
                .iter()
                .filter_map(|ext| companion(path, ext)),
        );
    }

    let mut hasher = Sha256::new();
    for file in &files {
        let metadata = std::fs::metadata(file).map_err(|err| SourceError::io(file, err))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(metadata.len().to_le_bytes());
        hasher.update(modified.to_le_bytes());
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}
