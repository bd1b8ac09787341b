//! Cache configuration.
//!
//! Controls the in-memory LRU tier and the on-disk payload tier via the `[cache]`
//! settings section.

use std::{num::NonZeroUsize, path::PathBuf};

use serde::Deserialize;

const DEFAULT_MEMORY_MAX_ENTRIES: usize = 256;
const DEFAULT_MEMORY_MAX_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_MEMORY_ENTRY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_DISK_DIRECTORY: &str = "cache/layers";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum payloads held in memory.
    pub memory_max_entries: usize,
    /// Upper bound on the summed size of in-memory payloads.
    pub memory_max_bytes: usize,
    /// Payloads larger than this are kept on disk only.
    pub memory_entry_limit_bytes: usize,
    pub disk_enabled: bool,
    pub disk_directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            memory_entry_limit_bytes: DEFAULT_MEMORY_ENTRY_LIMIT_BYTES,
            disk_enabled: true,
            disk_directory: PathBuf::from(DEFAULT_DISK_DIRECTORY),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            memory_max_entries: settings.memory_max_entries.get(),
            memory_max_bytes: settings.memory_max_bytes,
            memory_entry_limit_bytes: settings.memory_entry_limit_bytes,
            disk_enabled: settings.disk_enabled,
            disk_directory: settings.disk_directory.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the memory entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
