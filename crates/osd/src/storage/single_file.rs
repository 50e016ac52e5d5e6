//! Single-container storage layout.
//!
//! All current objects of a file share one container:
//!   `{base}/{h1}/{h2}/{file_id}.data`
//!
//! Object `n` lives at `row(n) * stripe_size` inside the container. A record
//! file `{file_id}.md` holds one fixed-size record per row naming the object
//! version stored there, its checksum and its length. The record is written
//! after the data, so it is the commit point of every change.
//!
//! Bytes an existing record already covers are never overwritten in place
//! directly. The new object is first logged whole as
//! `{file_id}.{obj:016x}.pend` (written by rename), then copied into the
//! container; loading a file replays any log a crash left behind.
//!
//! Versions preserved by copy-on-write move to an append-only history file
//! `{file_id}.hist` of `[record][data]` entries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use osd_proto::constants::*;
use osd_proto::defaults::DEFAULT_SINGLE_FILE_DIR_DEPTH;
use osd_proto::error::{OsdError, OsdResult};
use osd_proto::hash::hash_dir_components;
use osd_proto::striping::StripingPolicy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::common::{self, run_blocking};
use super::{FileMetadata, MetadataCache, ObjectInformation, SharedMetadata, StorageLayout};
use crate::config::{self, EngineConfig, LayoutInfo};
use crate::version_table::VersionTable;

/// Size of one encoded `ObjectRecord`.
const RECORD_LEN: u64 = 32;

/// Zeros are written in chunks of this size.
const ZERO_CHUNK: usize = 64 * 1024;

/// Location and identity of one stored object version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ObjectRecord {
    obj_no: u64,
    version: u64,
    checksum: u64,
    length: u64,
}

impl ObjectRecord {
    fn encode(&self) -> [u8; RECORD_LEN as usize] {
        let mut buf = [0u8; RECORD_LEN as usize];
        buf[0..8].copy_from_slice(&self.obj_no.to_be_bytes());
        buf[8..16].copy_from_slice(&self.version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf[24..32].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a record; short input decodes as the empty record.
    fn decode(buf: &[u8]) -> Self {
        if buf.len() < RECORD_LEN as usize {
            return Self::default();
        }
        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(bytes)
        };
        Self {
            obj_no: field(0),
            version: field(1),
            checksum: field(2),
            length: field(3),
        }
    }

    fn holds(&self, obj_no: u64) -> bool {
        self.version != NO_VERSION && self.obj_no == obj_no
    }
}

/// Position of one preserved version inside the history file.
#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    data_offset: u64,
    length: u64,
    checksum: u64,
}

/// `(obj_no, version)` -> history entry. `None` until first scanned.
type HistoryIndex = BTreeMap<(u64, u64), HistoryEntry>;
type HistoryHandle = Arc<Mutex<Option<HistoryIndex>>>;

/// Paths of everything stored for one file.
#[derive(Debug, Clone)]
struct FilePaths {
    file_id: String,
    dir: PathBuf,
    data: PathBuf,
    records: PathBuf,
    history: PathBuf,
    tepoch: PathBuf,
    vtable: PathBuf,
}

impl FilePaths {
    fn all(&self) -> [&Path; 5] {
        [
            &self.data,
            &self.records,
            &self.history,
            &self.tepoch,
            &self.vtable,
        ]
    }

    /// Log of an in-flight overwrite of `obj_no`.
    fn pending(&self, obj_no: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{:016x}{}", self.file_id, obj_no, PENDING_SUFFIX))
    }

    /// Overwrite logs currently on disk for this file.
    fn pending_logs(&self) -> OsdResult<Vec<PathBuf>> {
        let prefix = format!("{}.", self.file_id);
        Ok(common::list_file_names(&self.dir)?
            .into_iter()
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(PENDING_SUFFIX))
                    .is_some_and(|obj| {
                        obj.len() == OBJ_NAME_FIELD_LEN && u64::from_str_radix(obj, 16).is_ok()
                    })
            })
            .map(|name| self.dir.join(name))
            .collect())
    }
}

/// One-container-per-file layout.
pub struct SingleFileStorageLayout {
    /// Base directory for this store instance.
    /// Set during `init()`.
    base: RwLock<Option<PathBuf>>,
    checksums: bool,
    subdirs: u32,
    cache: MetadataCache,
    history: DashMap<String, HistoryHandle>,
}

impl SingleFileStorageLayout {
    pub fn new(checksums: bool, subdirs: u32, cache_size: usize) -> Self {
        Self {
            base: RwLock::new(None),
            checksums,
            subdirs,
            cache: MetadataCache::new(cache_size),
            history: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.checksums, cfg.subdirs, cfg.metadata_cache_size)
    }

    fn base_path(&self) -> OsdResult<PathBuf> {
        self.base.read().clone().ok_or(OsdError::NoStore)
    }

    fn paths(&self, file_id: &str) -> OsdResult<FilePaths> {
        common::validate_file_id(file_id)?;
        let mut dir = self.base_path()?;
        for part in hash_dir_components(file_id, self.subdirs, DEFAULT_SINGLE_FILE_DIR_DEPTH) {
            dir.push(part);
        }
        let named = |suffix: &str| dir.join(format!("{}{}", file_id, suffix));
        Ok(FilePaths {
            data: named(DATA_SUFFIX),
            records: named(MD_SUFFIX),
            history: named(HIST_SUFFIX),
            tepoch: named(TEPOCH_FILENAME),
            vtable: named(VTABLE_FILENAME),
            file_id: file_id.to_string(),
            dir,
        })
    }

    fn history_handle(&self, file_id: &str) -> HistoryHandle {
        self.history
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn read_record(path: &Path, row: u64) -> OsdResult<ObjectRecord> {
        match common::read_at(path, row * RECORD_LEN, RECORD_LEN as usize) {
            Ok(buf) => Ok(ObjectRecord::decode(&buf)),
            Err(OsdError::NotFound) => Ok(ObjectRecord::default()),
            Err(e) => Err(e),
        }
    }

    fn write_record(path: &Path, row: u64, record: &ObjectRecord, sync: bool) -> OsdResult<()> {
        common::write_at(path, row * RECORD_LEN, &record.encode(), sync)
    }

    fn read_all_records(path: &Path) -> OsdResult<Vec<ObjectRecord>> {
        let data = match common::read_all(path) {
            Ok(data) => data,
            Err(OsdError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(data
            .chunks_exact(RECORD_LEN as usize)
            .map(ObjectRecord::decode)
            .filter(|r| r.version != NO_VERSION)
            .collect())
    }

    /// Write `len` zero bytes at `offset`.
    fn write_zeros(path: &Path, offset: u64, len: u64) -> OsdResult<()> {
        let chunk = vec![0u8; ZERO_CHUNK.min(len as usize)];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk.len() as u64) as usize;
            common::write_at(path, offset + done, &chunk[..n], false)?;
            done += n as u64;
        }
        Ok(())
    }

    /// Scan the history file, dropping a torn entry at its end.
    fn scan_history(path: &Path) -> OsdResult<HistoryIndex> {
        let mut index = HistoryIndex::new();
        let Some(flen) = common::file_len(path)? else {
            return Ok(index);
        };
        let mut offset = 0u64;
        while offset + RECORD_LEN <= flen {
            let header = ObjectRecord::decode(&common::read_at(path, offset, RECORD_LEN as usize)?);
            let data_offset = offset + RECORD_LEN;
            if data_offset + header.length > flen {
                break;
            }
            index.insert(
                (header.obj_no, header.version),
                HistoryEntry {
                    data_offset,
                    length: header.length,
                    checksum: header.checksum,
                },
            );
            offset = data_offset + header.length;
        }
        if offset < flen {
            warn!(
                "single: dropping torn history entry at {} in {}",
                offset,
                path.display()
            );
            common::set_len(path, offset)?;
        }
        Ok(index)
    }

    /// Run `f` on the loaded history index of a file.
    fn with_history<T>(
        handle: &HistoryHandle,
        path: &Path,
        f: impl FnOnce(&mut HistoryIndex) -> OsdResult<T>,
    ) -> OsdResult<T> {
        let mut guard = handle.lock();
        if guard.is_none() {
            *guard = Some(Self::scan_history(path)?);
        }
        match guard.as_mut() {
            Some(index) => f(index),
            None => Err(OsdError::SystemError),
        }
    }

    /// Append the version described by `record` to the history file.
    fn preserve(
        paths: &FilePaths,
        handle: &HistoryHandle,
        row_offset: u64,
        record: &ObjectRecord,
    ) -> OsdResult<()> {
        let data = common::read_at(&paths.data, row_offset, record.length as usize)?;
        Self::with_history(handle, &paths.history, |index| {
            let offset = common::file_len(&paths.history)?.unwrap_or(0);
            let mut entry = Vec::with_capacity(RECORD_LEN as usize + data.len());
            entry.extend_from_slice(&record.encode());
            entry.extend_from_slice(&data);
            entry.resize(RECORD_LEN as usize + record.length as usize, 0);
            common::write_at(&paths.history, offset, &entry, true)?;
            index.insert(
                (record.obj_no, record.version),
                HistoryEntry {
                    data_offset: offset + RECORD_LEN,
                    length: record.length,
                    checksum: record.checksum,
                },
            );
            Ok(())
        })?;
        debug!("single: preserved obj {} v{}", record.obj_no, record.version);
        Ok(())
    }

    /// Rewrite the history file without `(obj_no, version)`.
    fn compact_history(
        path: &Path,
        index: &mut HistoryIndex,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()> {
        if index.remove(&(obj_no, version)).is_none() {
            return Ok(());
        }
        if index.is_empty() {
            return common::remove_if_exists(path);
        }

        let mut buf = Vec::new();
        let mut rebuilt = HistoryIndex::new();
        for (&(o, v), entry) in index.iter() {
            let data = common::read_at(path, entry.data_offset, entry.length as usize)?;
            let header = ObjectRecord {
                obj_no: o,
                version: v,
                checksum: entry.checksum,
                length: entry.length,
            };
            buf.extend_from_slice(&header.encode());
            rebuilt.insert(
                (o, v),
                HistoryEntry {
                    data_offset: buf.len() as u64,
                    ..*entry
                },
            );
            buf.extend_from_slice(&data);
        }
        common::atomic_write(path, &buf, true)?;
        *index = rebuilt;
        Ok(())
    }

    /// Current record of `obj_no`, preserving it first if a COW write is
    /// about to replace it.
    fn prepare_change(
        paths: &FilePaths,
        handle: &HistoryHandle,
        policy: &StripingPolicy,
        obj_no: u64,
        new_version: u64,
        cow: bool,
    ) -> OsdResult<ObjectRecord> {
        let row = policy.row(obj_no);
        let record = Self::read_record(&paths.records, row)?;
        if !record.holds(obj_no) {
            return Ok(ObjectRecord {
                obj_no,
                ..Default::default()
            });
        }
        if cow && record.version != new_version {
            let row_offset = row * policy.stripe_size_for_object(obj_no) as u64;
            Self::preserve(paths, handle, row_offset, &record)?;
        }
        Ok(record)
    }

    /// Store the record of a new version and publish it in `md`.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        paths: &FilePaths,
        md: &SharedMetadata,
        policy: &StripingPolicy,
        obj_no: u64,
        version: u64,
        length: u64,
        checksums: bool,
        sync: bool,
    ) -> OsdResult<()> {
        let row = policy.row(obj_no);
        let checksum = if checksums && length == 0 {
            common::checksum(&[])
        } else if checksums {
            let row_offset = row * policy.stripe_size_for_object(obj_no) as u64;
            common::checksum(&common::read_at(&paths.data, row_offset, length as usize)?)
        } else {
            0
        };
        let record = ObjectRecord {
            obj_no,
            version,
            checksum,
            length,
        };
        Self::write_record(&paths.records, row, &record, sync)?;

        let mut md = md.lock();
        md.update_object_version(obj_no, version);
        md.set_object_checksum(obj_no, version, checksum);
        Ok(())
    }

    /// Replace an object's stored bytes with `content` as `version`,
    /// logging the new object before the container is touched.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_logged(
        paths: &FilePaths,
        md: &SharedMetadata,
        policy: &StripingPolicy,
        obj_no: u64,
        version: u64,
        content: &[u8],
        checksums: bool,
        sync: bool,
    ) -> OsdResult<()> {
        let record = ObjectRecord {
            obj_no,
            version,
            checksum: if checksums { common::checksum(content) } else { 0 },
            length: content.len() as u64,
        };
        let log = paths.pending(obj_no);
        let mut entry = Vec::with_capacity(RECORD_LEN as usize + content.len());
        entry.extend_from_slice(&record.encode());
        entry.extend_from_slice(content);
        common::atomic_write(&log, &entry, sync)?;
        Self::apply_logged(paths, policy, &record, content, &log, sync)?;

        let mut md = md.lock();
        md.update_object_version(obj_no, version);
        md.set_object_checksum(obj_no, version, record.checksum);
        Ok(())
    }

    /// Copy a logged object into the container, commit its record and drop
    /// the log.
    fn apply_logged(
        paths: &FilePaths,
        policy: &StripingPolicy,
        record: &ObjectRecord,
        content: &[u8],
        log: &Path,
        sync: bool,
    ) -> OsdResult<()> {
        let row = policy.row(record.obj_no);
        let row_offset = row * policy.stripe_size_for_object(record.obj_no) as u64;
        common::write_at(&paths.data, row_offset, content, sync)?;
        Self::write_record(&paths.records, row, record, sync)?;
        common::remove_if_exists(log)
    }

    /// Finish overwrites interrupted by a crash.
    fn replay_logged(paths: &FilePaths, policy: &StripingPolicy) -> OsdResult<()> {
        for log in paths.pending_logs()? {
            let entry = common::read_all(&log)?;
            let record = ObjectRecord::decode(&entry);
            let content = entry.get(RECORD_LEN as usize..).unwrap_or_default();
            if record.version == NO_VERSION || content.len() as u64 != record.length {
                warn!("single: dropping unusable overwrite log {}", log.display());
                common::remove_if_exists(&log)?;
                continue;
            }
            info!(
                "single: replaying logged write of obj {} v{} in {}",
                record.obj_no,
                record.version,
                paths.data.display()
            );
            Self::apply_logged(paths, policy, &record, content, &log, true)?;
        }
        Ok(())
    }

    fn load_blocking(
        paths: &FilePaths,
        handle: &HistoryHandle,
        policy: StripingPolicy,
    ) -> OsdResult<FileMetadata> {
        Self::replay_logged(paths, &policy)?;
        let mut md = FileMetadata::new(policy, VersionTable::new(paths.vtable.clone()));
        md.set_truncate_epoch(common::read_u64_file(&paths.tepoch)?);

        let records = Self::read_all_records(&paths.records)?;
        for record in &records {
            md.update_object_version(record.obj_no, record.version);
            md.set_object_checksum(record.obj_no, record.version, record.checksum);
        }

        Self::with_history(handle, &paths.history, |index| {
            for (&(obj_no, version), entry) in index.iter() {
                md.note_stored_version(obj_no, version);
                md.set_object_checksum(obj_no, version, entry.checksum);
            }
            Ok(())
        })?;

        if let Some(last) = records.iter().max_by_key(|r| r.obj_no) {
            let len = if last.length == 0 {
                policy.stripe_size_for_object(last.obj_no) as u64
            } else {
                last.length
            };
            md.set_last_object(Some(last.obj_no));
            md.set_file_size(policy.object_start_offset(last.obj_no) + len);
        }

        md.version_table_mut().load()?;
        Ok(md)
    }
}

impl Default for SingleFileStorageLayout {
    fn default() -> Self {
        Self::from_config(&EngineConfig::new(""))
    }
}

#[async_trait]
impl StorageLayout for SingleFileStorageLayout {
    fn name(&self) -> &str {
        "single"
    }

    fn layout_tag(&self) -> u32 {
        SINGLE_FILE_LAYOUT_TAG
    }

    fn metadata_cache(&self) -> &MetadataCache {
        &self.cache
    }

    async fn init(&self, path: &Path, first_time: bool) -> OsdResult<()> {
        let path = path.to_path_buf();
        let info = LayoutInfo {
            name: self.name().to_string(),
            tag: self.layout_tag(),
        };

        let dir = path.clone();
        run_blocking(move || {
            if first_time {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    warn!("single: failed to create store dir {}: {}", dir.display(), e);
                    OsdError::Eio
                })?;
            } else if !dir.is_dir() {
                warn!("single: store dir missing at {}", dir.display());
                return Err(OsdError::NoStore);
            }
            config::ensure_layout_info(&dir, &info)
        })
        .await?;

        info!("single: initialized store at {}", path.display());
        *self.base.write() = Some(path);
        Ok(())
    }

    async fn load_file_metadata(
        &self,
        file_id: &str,
        policy: StripingPolicy,
    ) -> OsdResult<FileMetadata> {
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        let md = run_blocking(move || Self::load_blocking(&paths, &handle, policy)).await?;
        debug!(
            "single: loaded {} (size {}, last {:?}, epoch {})",
            file_id,
            md.file_size(),
            md.last_object(),
            md.truncate_epoch()
        );
        Ok(md)
    }

    async fn file_exists(&self, file_id: &str) -> OsdResult<bool> {
        let paths = self.paths(file_id)?;
        run_blocking(move || Ok(paths.all().iter().any(|p| p.exists()))).await
    }

    async fn read_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        offset: u32,
        length: u32,
        version: u64,
    ) -> OsdResult<ObjectInformation> {
        if version == NO_VERSION {
            return Ok(ObjectInformation::DoesNotExist);
        }
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        let (policy, expected) = {
            let md = md.lock();
            (md.policy(), md.object_checksum(obj_no, version))
        };
        let checksums = self.checksums;

        run_blocking(move || {
            let row = policy.row(obj_no);
            let record = Self::read_record(&paths.records, row)?;

            let (source, start, object_len) = if record.holds(obj_no) && record.version == version {
                let row_offset = row * policy.stripe_size_for_object(obj_no) as u64;
                (paths.data.clone(), row_offset, record.length)
            } else {
                let found = Self::with_history(&handle, &paths.history, |index| {
                    Ok(index.get(&(obj_no, version)).copied())
                })?;
                match found {
                    Some(entry) => (paths.history.clone(), entry.data_offset, entry.length),
                    None => return Ok(ObjectInformation::DoesNotExist),
                }
            };

            if object_len == 0 {
                return Ok(ObjectInformation::Padding);
            }
            let offset = offset as u64;
            if offset >= object_len {
                return Ok(ObjectInformation::Exists(Vec::new()));
            }
            let avail = object_len - offset;
            let len = if length == FULL_OBJECT_LENGTH {
                avail
            } else {
                avail.min(length as u64)
            };

            if checksums {
                let data = common::read_at(&source, start, object_len as usize)?;
                if common::checksum(&data) != expected {
                    warn!(
                        "single: checksum mismatch on obj {} v{} in {}",
                        obj_no,
                        version,
                        source.display()
                    );
                    return Err(OsdError::ChecksumMismatch);
                }
                let from = offset as usize;
                return Ok(ObjectInformation::Exists(
                    data[from..from + len as usize].to_vec(),
                ));
            }

            let mut data = common::read_at(&source, start + offset, len as usize)?;
            // the container may end before a trailing zero range
            data.resize(len as usize, 0);
            Ok(ObjectInformation::Exists(data))
        })
        .await
    }

    async fn write_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        data: &[u8],
        obj_no: u64,
        offset: u32,
        new_version: u64,
        sync: bool,
        cow: bool,
    ) -> OsdResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let policy = md.lock().policy();
        let stripe_size = policy.stripe_size_for_object(obj_no) as u64;
        let offset = offset as u64;
        if offset + data.len() as u64 > stripe_size {
            return Err(OsdError::InvalidParms);
        }

        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        let md = md.clone();
        let data = data.to_vec();
        let checksums = self.checksums;

        run_blocking(move || {
            let old = Self::prepare_change(&paths, &handle, &policy, obj_no, new_version, cow)?;
            let row_offset = policy.row(obj_no) * stripe_size;
            let length = old.length.max(offset + data.len() as u64);

            if offset < old.length {
                let mut content = common::read_at(&paths.data, row_offset, old.length as usize)?;
                content.resize(length as usize, 0);
                let start = offset as usize;
                content[start..start + data.len()].copy_from_slice(&data);
                Self::rewrite_logged(
                    &paths, &md, &policy, obj_no, new_version, &content, checksums, sync,
                )?;
            } else {
                // only bytes past the committed length change
                if offset > old.length {
                    Self::write_zeros(&paths.data, row_offset + old.length, offset - old.length)?;
                }
                common::write_at(&paths.data, row_offset + offset, &data, sync)?;
                Self::commit(&paths, &md, &policy, obj_no, new_version, length, checksums, sync)?;
            }
            debug!(
                "single: wrote {} bytes at {} to obj {} v{}",
                data.len(),
                offset,
                obj_no,
                new_version
            );
            Ok(())
        })
        .await
    }

    async fn truncate_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        new_length: u32,
        new_version: u64,
        cow: bool,
    ) -> OsdResult<()> {
        let policy = md.lock().policy();
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        let md = md.clone();
        let checksums = self.checksums;

        run_blocking(move || {
            let old = Self::prepare_change(&paths, &handle, &policy, obj_no, new_version, cow)?;
            let new_length = new_length as u64;
            if old.version == new_version && old.length == new_length {
                return Ok(());
            }
            let row_offset = policy.row(obj_no) * policy.stripe_size_for_object(obj_no) as u64;
            if new_length > old.length {
                Self::write_zeros(&paths.data, row_offset + old.length, new_length - old.length)?;
            }
            Self::commit(&paths, &md, &policy, obj_no, new_version, new_length, checksums, true)?;
            debug!("single: truncated obj {} to {} (v{})", obj_no, new_length, new_version);
            Ok(())
        })
        .await
    }

    async fn create_padding_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
        size: u32,
    ) -> OsdResult<()> {
        let policy = md.lock().policy();
        let paths = self.paths(file_id)?;
        let md = md.clone();
        let checksums = self.checksums;

        run_blocking(move || {
            let row_offset = policy.row(obj_no) * policy.stripe_size_for_object(obj_no) as u64;
            Self::write_zeros(&paths.data, row_offset, size as u64)?;
            Self::commit(&paths, &md, &policy, obj_no, version, size as u64, checksums, true)?;
            debug!("single: padding obj {} v{} ({} bytes)", obj_no, version, size);
            Ok(())
        })
        .await
    }

    async fn delete_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()> {
        let policy = md.lock().policy();
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        let md = md.clone();

        run_blocking(move || {
            let row = policy.row(obj_no);
            let record = Self::read_record(&paths.records, row)?;
            if record.holds(obj_no) && record.version == version {
                Self::write_record(&paths.records, row, &ObjectRecord::default(), true)?;
            } else {
                Self::with_history(&handle, &paths.history, |index| {
                    Self::compact_history(&paths.history, index, obj_no, version)
                })?;
            }
            md.lock().discard_object(obj_no, version);
            debug!("single: deleted obj {} v{}", obj_no, version);
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, file_id: &str, delete_metadata: bool) -> OsdResult<()> {
        let paths = self.paths(file_id)?;
        let base = self.base_path()?;
        let handle = self.history_handle(file_id);
        if delete_metadata {
            self.cache.remove(file_id);
        }

        run_blocking(move || {
            let mut guard = handle.lock();
            for path in [&paths.data, &paths.records, &paths.history] {
                common::remove_if_exists(path)?;
            }
            for log in paths.pending_logs()? {
                common::remove_if_exists(&log)?;
            }
            *guard = Some(HistoryIndex::new());
            if delete_metadata {
                common::remove_if_exists(&paths.tepoch)?;
                common::remove_if_exists(&paths.vtable)?;
                common::prune_empty_dirs(&paths.dir, &base);
            }
            Ok(())
        })
        .await?;

        if delete_metadata {
            self.history.remove(file_id);
        }
        debug!("single: deleted file {} (metadata: {})", file_id, delete_metadata);
        Ok(())
    }

    async fn set_truncate_epoch(&self, file_id: &str, epoch: u64) -> OsdResult<()> {
        let path = self.paths(file_id)?.tepoch;
        run_blocking(move || common::write_u64_file(&path, epoch)).await
    }

    /// Records are current by construction, so only retiring a version has
    /// work to do: it moves from the container into the history file.
    async fn update_current_obj_version(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()> {
        if version != NO_VERSION {
            return Ok(());
        }
        let policy = md.lock().policy();
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);

        run_blocking(move || {
            let row = policy.row(obj_no);
            let record = Self::read_record(&paths.records, row)?;
            if !record.holds(obj_no) {
                return Ok(());
            }
            let row_offset = row * policy.stripe_size_for_object(obj_no) as u64;
            Self::preserve(&paths, &handle, row_offset, &record)?;
            Self::write_record(&paths.records, row, &ObjectRecord::default(), true)
        })
        .await
    }

    async fn update_current_version_size(
        &self,
        _file_id: &str,
        _last_object: Option<u64>,
    ) -> OsdResult<()> {
        Ok(())
    }

    async fn get_object_set(&self, file_id: &str, _md: &SharedMetadata) -> OsdResult<BTreeSet<u64>> {
        let paths = self.paths(file_id)?;
        let handle = self.history_handle(file_id);
        run_blocking(move || {
            let mut objects: BTreeSet<u64> = Self::read_all_records(&paths.records)?
                .iter()
                .map(|r| r.obj_no)
                .collect();
            Self::with_history(&handle, &paths.history, |index| {
                objects.extend(index.keys().map(|&(obj_no, _)| obj_no));
                Ok(())
            })?;
            Ok(objects)
        })
        .await
    }

    async fn get_file_id_list(&self) -> OsdResult<Vec<String>> {
        let base = self.base_path()?;
        let levels = hash_dir_components("", self.subdirs, DEFAULT_SINGLE_FILE_DIR_DEPTH).len();

        run_blocking(move || {
            let mut dirs = vec![base];
            for _ in 0..levels {
                let mut next = Vec::new();
                for dir in &dirs {
                    for name in common::list_dir_names(dir)? {
                        next.push(dir.join(name));
                    }
                }
                dirs = next;
            }

            let mut ids = Vec::new();
            for dir in &dirs {
                for name in common::list_file_names(dir)? {
                    if let Some(id) = name.strip_suffix(MD_SUFFIX) {
                        ids.push(id.to_string());
                    }
                }
            }
            debug!("single: found {} files", ids.len());
            Ok(ids)
        })
        .await
    }
}
