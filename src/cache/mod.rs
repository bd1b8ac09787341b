//! Layer payload cache.
//!
//! Two tiers keyed by [`CacheKey`] (layer, tolerance, feature cap, viewport):
//!
//! - **Memory**: LRU bounded by entry count and total bytes
//! - **Disk**: one file per key, kept until explicitly invalidated
//!
//! Every hit is checked against the current source fingerprint. Concurrent misses for
//! the same key share a single generation.
//!
//! ```toml
//! [cache]
//! memory_max_entries = 256
//! memory_entry_limit_bytes = 10485760
//! disk_directory = "cache/layers"
//! ```

mod config;
mod disk;
mod flight;
mod keys;
mod lock;
mod manager;
mod memory;
mod payload;

pub use config::CacheConfig;
pub use disk::{CacheWriteError, DiskTier};
pub use flight::{CacheStatus, GenerationError, Pending, ProgressSink, ProgressStream};
pub use keys::CacheKey;
pub use manager::{CacheManager, Lookup};
pub use memory::{MemoryInsert, MemoryTier};
pub use payload::{CachedPayload, GeneratedPayload, PayloadMeta};

pub(crate) use manager::{
    METRIC_COALESCED, METRIC_DISK_HIT, METRIC_MEMORY_HIT, METRIC_MISS, METRIC_WRITE_ERROR,
};
pub(crate) use memory::METRIC_MEMORY_EVICT;
