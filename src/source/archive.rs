//! Zip bundles: shapefile archives are unpacked into staging, KMZ entries are read in place.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::{Fingerprint, SourceError};
use crate::domain::layer::SourceFormat;

const EXTRACT_PREFIX: &str = "extract-";
const SCRATCH_PREFIX: &str = ".extract-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Plain,
    Zip,
    Kmz,
}

impl ArchiveKind {
    pub fn of(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("zip") => Self::Zip,
            Some("kmz") => Self::Kmz,
            _ => Self::Plain,
        }
    }
}

/// Resolve a materialized source to the file its reader should open.
///
/// Zip bundles are extracted once per fingerprint under `staging`; later calls reuse
/// the extracted tree. Extracting a new fingerprint removes the archive's older trees.
pub fn prepare_source(
    path: &Path,
    format: SourceFormat,
    staging: &Path,
    fingerprint: &Fingerprint,
) -> Result<PathBuf, SourceError> {
    if ArchiveKind::of(path) != ArchiveKind::Zip {
        return Ok(path.to_path_buf());
    }

    let prefix = extraction_prefix(path);
    let target = staging.join(format!("{prefix}{}", fingerprint.short()));
    if !target.is_dir() {
        extract(path, staging, &target)?;
        match prune(staging, &prefix, Some(&target)) {
            Ok(0) => {}
            Ok(removed) => {
                debug!(archive = %path.display(), removed, "Removed superseded extractions");
            }
            Err(err) => {
                warn!(archive = %path.display(), error = %err, "Could not remove superseded extractions");
            }
        }
    } else {
        debug!(archive = %path.display(), target = %target.display(), "Reusing extracted archive");
    }

    let wanted: &[&str] = match format {
        SourceFormat::Shapefile => &["shp"],
        SourceFormat::GeoJson => &["geojson", "json"],
        SourceFormat::Kml => &["kml"],
    };
    find_recursive(&target, wanted)
        .map_err(|err| SourceError::io(&target, err))?
        .ok_or_else(|| {
            SourceError::format(
                path,
                format!("archive contains no `.{}` file", wanted.join("`/`.")),
            )
        })
}

fn extract(archive_path: &Path, staging: &Path, target: &Path) -> Result<(), SourceError> {
    fs::create_dir_all(staging).map_err(|err| SourceError::io(staging, err))?;

    let file = File::open(archive_path).map_err(|err| SourceError::io(archive_path, err))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| SourceError::format(archive_path, format!("invalid zip archive: {err}")))?;

    // Unpack next to the target and rename so a half-written tree is never reused.
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(staging)
        .map_err(|err| SourceError::io(staging, err))?;
    archive
        .extract(scratch.path())
        .map_err(|err| SourceError::format(archive_path, format!("could not unpack: {err}")))?;

    let unpacked = scratch.keep();
    if let Err(err) = fs::rename(&unpacked, target) {
        let _ = fs::remove_dir_all(&unpacked);
        // Another worker may have won the race.
        if !target.is_dir() {
            return Err(SourceError::io(target, err));
        }
    }

    info!(
        archive = %archive_path.display(),
        target = %target.display(),
        entries = archive.len(),
        "Extracted source archive"
    );
    Ok(())
}

/// Remove every extracted tree of `archive` under `staging`.
pub fn remove_extractions(staging: &Path, archive: &Path) -> io::Result<usize> {
    prune(staging, &extraction_prefix(archive), None)
}

/// Remove every extracted tree under `staging`, including abandoned scratch directories.
pub fn remove_all_extractions(staging: &Path) -> io::Result<usize> {
    Ok(prune(staging, EXTRACT_PREFIX, None)? + prune(staging, SCRATCH_PREFIX, None)?)
}

/// Directory name prefix shared by all extractions of one archive path.
fn extraction_prefix(archive: &Path) -> String {
    let digest = hex::encode(Sha256::digest(archive.to_string_lossy().as_bytes()));
    format!("{EXTRACT_PREFIX}{}-", &digest[..12])
}

fn prune(staging: &Path, prefix: &str, keep: Option<&Path>) -> io::Result<usize> {
    let entries = match fs::read_dir(staging) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let matches = entry.file_name().to_string_lossy().starts_with(prefix)
            && entry.file_type()?.is_dir()
            && keep != Some(path.as_path());
        if !matches {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            // A concurrent prune got there first.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}

/// First file (in sorted path order) with one of the given extensions.
fn find_recursive(dir: &Path, extensions: &[&str]) -> std::io::Result<Option<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    entries.sort();

    for entry in &entries {
        let matches = entry.is_file()
            && entry.extension().is_some_and(|ext| {
                extensions
                    .iter()
                    .any(|wanted| ext.eq_ignore_ascii_case(wanted))
            });
        if matches {
            return Ok(Some(entry.clone()));
        }
    }
    for entry in entries.iter().filter(|entry| entry.is_dir()) {
        if let Some(found) = find_recursive(entry, extensions)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Bytes of the first entry with the given extension, e.g. the document inside a KMZ.
pub fn read_first_entry(path: &Path, extension: &str) -> Result<Vec<u8>, SourceError> {
    let file = File::open(path).map_err(|err| SourceError::io(path, err))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| SourceError::format(path, format!("invalid zip archive: {err}")))?;

    let suffix = format!(".{}", extension.to_ascii_lowercase());
    let index = (0..archive.len()).find(|&i| {
        archive
            .name_for_index(i)
            .is_some_and(|name| name.to_ascii_lowercase().ends_with(&suffix))
    });
    let Some(index) = index else {
        return Err(SourceError::format(
            path,
            format!("archive contains no `{suffix}` entry"),
        ));
    };

    let mut entry = archive
        .by_index(index)
        .map_err(|err| SourceError::format(path, format!("unreadable entry: {err}")))?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| SourceError::format(path, format!("unreadable entry: {err}")))?;
    Ok(bytes)
}
