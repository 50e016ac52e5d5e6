/// Object storage protocol and on-disk format constants.

/// Read length meaning "the whole object as currently sized".
pub const FULL_OBJECT_LENGTH: u32 = u32::MAX;

/// Advisory lock length meaning "from offset to end of file".
pub const LOCK_LENGTH_TO_EOF: u64 = 0;

/// Object version 0 means the object was never written.
pub const NO_VERSION: u64 = 0;

/// Smallest permitted stripe size (4 KB)
pub const MIN_STRIPE_SIZE: u32 = 4 * 1024;
/// Largest permitted stripe size (64 MB)
pub const MAX_STRIPE_SIZE: u32 = 64 * 1024 * 1024;
/// Default stripe size (128 KB)
pub const DEFAULT_STRIPE_SIZE: u32 = 128 * 1024;

// On-disk names

/// Layout descriptor at the root of a storage directory
pub const LAYOUT_INFO_FILENAME: &str = ".version";
/// Per-file truncate epoch
pub const TEPOCH_FILENAME: &str = ".tepoch";
/// Per-file version table
pub const VTABLE_FILENAME: &str = ".vtable";
/// Per-file current object versions (hash layout, versioning on)
pub const CURRENT_VER_FILENAME: &str = ".curr_file_ver";

/// Single-file layout: object data container suffix
pub const DATA_SUFFIX: &str = ".data";
/// Single-file layout: per-row metadata record suffix
pub const MD_SUFFIX: &str = ".md";
/// Single-file layout: preserved prior versions suffix
pub const HIST_SUFFIX: &str = ".hist";
/// Single-file layout: logged overwrite of one object, `{file_id}.{obj:016x}.pend`
pub const PENDING_SUFFIX: &str = ".pend";

/// Hex digits per 64-bit field in an object file name
pub const OBJ_NAME_FIELD_LEN: usize = 16;
/// Total length of an object file name: objNo + version + checksum
pub const OBJ_NAME_LEN: usize = OBJ_NAME_FIELD_LEN * 3;

/// Layout tag written by the hashed per-object-file layout
pub const HASH_LAYOUT_TAG: u32 = 0x0002;
/// Layout tag written by the single-container-file layout
pub const SINGLE_FILE_LAYOUT_TAG: u32 = 0x0002_0001;

/// Magic number opening a persisted version table
pub const VTABLE_MAGIC: u32 = 0x5654_424c; // "VTBL"
