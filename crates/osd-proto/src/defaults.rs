//! Tunable operational defaults for the object storage daemon.
//!
//! On-disk format constants remain in [`crate::constants`]. This module
//! centralizes the configurable defaults that can be overridden via CLI
//! flags.

// ─── Storage Layout ─────────────────────────────────────────────────────────

/// Default storage layout name.
pub const DEFAULT_LAYOUT: &str = "hash";

/// Default number of subdirectories per hash directory level.
/// 256 subdirectories means two hex digits per level.
pub const DEFAULT_SUBDIRS: u32 = 256;

/// Default depth of the hashed directory tree.
pub const DEFAULT_MAX_DIR_DEPTH: u32 = 4;

/// Directory levels used by the single-file layout.
pub const DEFAULT_SINGLE_FILE_DIR_DEPTH: u32 = 2;

/// Checksums are off unless requested.
pub const DEFAULT_CHECKSUMS_ENABLED: bool = false;

/// Object writes are fsynced before they are acknowledged.
pub const DEFAULT_SYNC_WRITES: bool = true;

// ─── Caches ─────────────────────────────────────────────────────────────────

/// Number of file metadata entries kept in the LRU cache.
pub const DEFAULT_METADATA_CACHE_SIZE: usize = 2048;

// ─── Open File Table ────────────────────────────────────────────────────────

/// Default lease granted on open / keep-alive (seconds).
pub const DEFAULT_LEASE_SECS: u64 = 60;

/// Interval between open file table sweeps (seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// ─── Striping ───────────────────────────────────────────────────────────────

/// Default stripe width (nodes per stripe row).
pub const DEFAULT_STRIPE_WIDTH: u32 = 1;

/// Default position of this node in the stripe.
pub const DEFAULT_NODE_INDEX: u32 = 0;
