//! Shared helper functions for storage layouts.
//!
//! Provides utilities for:
//! - Encoding and parsing object file names
//! - Atomic file writes (write-to-tmp then rename)
//! - Positioned reads and small fixed-width metadata files
//! - Checksums and empty directory pruning

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use osd_proto::constants::{OBJ_NAME_FIELD_LEN, OBJ_NAME_LEN};
use osd_proto::error::{OsdError, OsdResult};
use tracing::{debug, warn};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Run blocking filesystem work off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> OsdResult<T>
where
    F: FnOnce() -> OsdResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| OsdError::SystemError)?
}

/// Format an object version as a file name: `{objNo}{version}{checksum}`,
/// each as 16 hex digits.
pub fn object_filename(obj_no: u64, version: u64, checksum: u64) -> String {
    format!("{:016x}{:016x}{:016x}", obj_no, version, checksum)
}

/// Parse `(obj_no, version, checksum)` from an object file name.
///
/// Returns `None` for anything that is not an object file.
pub fn parse_object_filename(name: &str) -> Option<(u64, u64, u64)> {
    if name.len() != OBJ_NAME_LEN || !name.is_ascii() {
        return None;
    }
    let field = |i: usize| {
        u64::from_str_radix(&name[i * OBJ_NAME_FIELD_LEN..(i + 1) * OBJ_NAME_FIELD_LEN], 16).ok()
    };
    Some((field(0)?, field(1)?, field(2)?))
}

/// CRC-32C of an object's content, widened to the stored checksum width.
pub fn checksum(data: &[u8]) -> u64 {
    crc32c::crc32c(data) as u64
}

/// Atomic write: write data to a temporary file, then rename into place.
///
/// The temp file is created in the same directory as `target` to guarantee
/// same-filesystem rename. Temp names are unique per call, so concurrent
/// writers to different objects in one directory never collide.
pub fn atomic_write(target: &Path, data: &[u8], sync: bool) -> OsdResult<()> {
    let dir = target.parent().ok_or(OsdError::InvalidParms)?;
    fs::create_dir_all(dir).map_err(|e| {
        warn!("failed to create dir {}: {}", dir.display(), e);
        OsdError::Eio
    })?;

    let tmp_path = dir.join(format!(
        ".tmp_{}_{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = fs::File::create(&tmp_path).map_err(|e| {
        warn!("failed to create tmp file {}: {}", tmp_path.display(), e);
        OsdError::Eio
    })?;
    file.write_all(data).map_err(|e| {
        warn!("failed to write tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path);
        OsdError::Eio
    })?;
    if sync {
        file.sync_all().map_err(|e| {
            warn!("failed to sync tmp file {}: {}", tmp_path.display(), e);
            let _ = fs::remove_file(&tmp_path);
            OsdError::Eio
        })?;
    }
    drop(file);

    fs::rename(&tmp_path, target).map_err(|e| {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        OsdError::Eio
    })?;

    Ok(())
}

/// Read up to `length` bytes at `offset` from an existing file.
///
/// A missing file is `NotFound`; a short file yields a short buffer.
pub fn read_at(path: &Path, offset: u64, length: usize) -> OsdResult<Vec<u8>> {
    let mut file = fs::File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OsdError::NotFound
        } else {
            warn!("failed to open {} for read: {}", path.display(), e);
            OsdError::Eio
        }
    })?;

    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        warn!("failed to seek in {}: {}", path.display(), e);
        OsdError::Eio
    })?;

    let mut buf = Vec::with_capacity(length);
    file.take(length as u64).read_to_end(&mut buf).map_err(|e| {
        warn!("failed to read from {}: {}", path.display(), e);
        OsdError::Eio
    })?;

    Ok(buf)
}

/// Read a whole file, `NotFound` if absent.
pub fn read_all(path: &Path) -> OsdResult<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OsdError::NotFound
        } else {
            warn!("failed to read {}: {}", path.display(), e);
            OsdError::Eio
        }
    })
}

/// Length of a file, `None` if it does not exist.
pub fn file_len(path: &Path) -> OsdResult<Option<u64>> {
    match fs::metadata(path) {
        Ok(md) => Ok(Some(md.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            warn!("failed to stat {}: {}", path.display(), e);
            Err(OsdError::Eio)
        }
    }
}

/// Remove a file, treating absence as success.
pub fn remove_if_exists(path: &Path) -> OsdResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("failed to remove {}: {}", path.display(), e);
            Err(OsdError::Eio)
        }
    }
}

/// Read a big-endian u64 stored in its own file. Missing file reads as 0.
pub fn read_u64_file(path: &Path) -> OsdResult<u64> {
    match read_all(path) {
        Ok(data) => {
            let bytes: [u8; 8] = data.get(..8).and_then(|b| b.try_into().ok()).ok_or_else(|| {
                warn!("truncated value file {}", path.display());
                OsdError::SystemError
            })?;
            Ok(u64::from_be_bytes(bytes))
        }
        Err(OsdError::NotFound) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Atomically replace a file holding a single big-endian u64.
pub fn write_u64_file(path: &Path, value: u64) -> OsdResult<()> {
    atomic_write(path, &value.to_be_bytes(), true)
}

/// Write `data` at `offset` into `path`, creating the file if needed.
/// Gaps before `offset` read back as zeros.
pub fn write_at(path: &Path, offset: u64, data: &[u8], sync: bool) -> OsdResult<()> {
    use std::os::unix::fs::FileExt;

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            warn!("failed to open {} for write: {}", path.display(), e);
            OsdError::Eio
        })?;
    file.write_all_at(data, offset).map_err(|e| {
        warn!("failed to write to {}: {}", path.display(), e);
        OsdError::Eio
    })?;
    if sync {
        file.sync_data().map_err(|_| OsdError::Eio)?;
    }
    Ok(())
}

/// Set the length of `path`, creating it if needed. New bytes read as zeros.
pub fn set_len(path: &Path, len: u64) -> OsdResult<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            warn!("failed to open {} for resize: {}", path.display(), e);
            OsdError::Eio
        })?;
    file.set_len(len).map_err(|e| {
        warn!("failed to resize {} to {}: {}", path.display(), len, e);
        OsdError::Eio
    })
}

/// Atomically create `target` as a sparse file of `len` zero bytes.
pub fn atomic_create_sparse(target: &Path, len: u64) -> OsdResult<()> {
    let dir = target.parent().ok_or(OsdError::InvalidParms)?;
    fs::create_dir_all(dir).map_err(|e| {
        warn!("failed to create dir {}: {}", dir.display(), e);
        OsdError::Eio
    })?;
    let tmp_path = dir.join(format!(
        ".tmp_{}_{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    set_len(&tmp_path, len)?;
    fs::rename(&tmp_path, target).map_err(|e| {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        OsdError::Eio
    })
}

/// Remove `dir` and then each now-empty ancestor, stopping at `stop_at`.
///
/// Removal stops at the first directory that is not empty.
pub fn prune_empty_dirs(dir: &Path, stop_at: &Path) {
    let mut cur = Some(dir);
    while let Some(d) = cur {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        debug!("removed empty dir {}", d.display());
        cur = d.parent();
    }
}

/// Names of the regular files in `dir`; an absent directory is empty.
pub fn list_file_names(dir: &Path) -> OsdResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            warn!("failed to read dir {}: {}", dir.display(), e);
            return Err(OsdError::Eio);
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|_| OsdError::Eio)?;
        let file_type = entry.file_type().map_err(|_| OsdError::Eio)?;
        if file_type.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Names of the subdirectories of `dir`; an absent directory is empty.
pub fn list_dir_names(dir: &Path) -> OsdResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            warn!("failed to read dir {}: {}", dir.display(), e);
            return Err(OsdError::Eio);
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|_| OsdError::Eio)?;
        let file_type = entry.file_type().map_err(|_| OsdError::Eio)?;
        if file_type.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Reject file IDs that could escape their directory.
pub fn validate_file_id(file_id: &str) -> OsdResult<()> {
    if file_id.is_empty()
        || file_id.starts_with('.')
        || file_id.contains('/')
        || file_id.contains('\0')
    {
        return Err(OsdError::InvalidParms);
    }
    Ok(())
}
