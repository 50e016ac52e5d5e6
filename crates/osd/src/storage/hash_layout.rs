//! Hashed per-object-file storage layout.
//!
//! Every object version is a file of its own:
//!   `{base}/{h1}/{h2}/.../{file_id}/{obj:016x}{ver:016x}{checksum:016x}`
//!
//! The `hN` components are hex chunks of the file ID hash, so no directory
//! grows beyond `subdirs` entries no matter how many files the node stores.
//! Next to the objects each file directory holds dot-files for the truncate
//! epoch, the version table and the current object versions.
//!
//! New content is always written to a temporary file and renamed into
//! place, so a reader sees either the old or the new version of an object.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use osd_proto::constants::*;
use osd_proto::error::{OsdError, OsdResult};
use osd_proto::hash::hash_dir_components;
use osd_proto::striping::StripingPolicy;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::common::{self, run_blocking};
use super::{FileMetadata, MetadataCache, ObjectInformation, SharedMetadata, StorageLayout};
use crate::config::{self, EngineConfig, LayoutInfo};
use crate::version_table::VersionTable;

/// One-file-per-object-version layout.
pub struct HashStorageLayout {
    /// Base directory for this store instance.
    /// Set during `init()`.
    base: RwLock<Option<PathBuf>>,
    checksums: bool,
    subdirs: u32,
    max_depth: u32,
    cache: MetadataCache,
}

impl HashStorageLayout {
    pub fn new(checksums: bool, subdirs: u32, max_depth: u32, cache_size: usize) -> Self {
        Self {
            base: RwLock::new(None),
            checksums,
            subdirs,
            max_depth,
            cache: MetadataCache::new(cache_size),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            cfg.checksums,
            cfg.subdirs,
            cfg.max_dir_depth,
            cfg.metadata_cache_size,
        )
    }

    /// Get the base path, returning an error if not initialized.
    fn base_path(&self) -> OsdResult<PathBuf> {
        self.base.read().clone().ok_or(OsdError::NoStore)
    }

    /// Directory holding the objects of `file_id`.
    fn file_dir(&self, file_id: &str) -> OsdResult<PathBuf> {
        common::validate_file_id(file_id)?;
        let mut dir = self.base_path()?;
        for part in hash_dir_components(file_id, self.subdirs, self.max_depth) {
            dir.push(part);
        }
        dir.push(file_id);
        Ok(dir)
    }

    /// Number of hash directory levels above a file directory.
    fn hash_levels(&self) -> usize {
        hash_dir_components("", self.subdirs, self.max_depth).len()
    }

    fn object_path(dir: &Path, obj_no: u64, version: u64, checksum: u64) -> PathBuf {
        dir.join(common::object_filename(obj_no, version, checksum))
    }

    /// Record the current version of an object in `.curr_file_ver`.
    fn write_current_version(dir: &Path, obj_no: u64, version: u64) -> OsdResult<()> {
        common::write_at(
            &dir.join(CURRENT_VER_FILENAME),
            obj_no * 8,
            &version.to_be_bytes(),
            false,
        )
    }

    /// Write `content` as `new_version` of an object and retire the
    /// previous file unless it must be preserved.
    ///
    /// The old file is only unlinked once `.curr_file_ver` names the new
    /// one, so a crash in between leaves an extra file, never a lost object.
    #[allow(clippy::too_many_arguments)]
    fn store_version(
        dir: &Path,
        md: &SharedMetadata,
        obj_no: u64,
        content: &[u8],
        new_version: u64,
        old: Option<PathBuf>,
        checksums: bool,
        sync: bool,
        keep_old: bool,
    ) -> OsdResult<()> {
        let checksum = if checksums { common::checksum(content) } else { 0 };
        let new_path = Self::object_path(dir, obj_no, new_version, checksum);
        common::atomic_write(&new_path, content, sync)?;
        Self::commit_version(dir, md, obj_no, new_version, checksum)?;

        if let Some(old_path) = old {
            if !keep_old && old_path != new_path {
                common::remove_if_exists(&old_path)?;
            }
        }
        Ok(())
    }

    /// Make `version` current in memory and in `.curr_file_ver`.
    fn commit_version(
        dir: &Path,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
        checksum: u64,
    ) -> OsdResult<()> {
        if md.lock().latest_object_version(obj_no) != version {
            Self::write_current_version(dir, obj_no, version)?;
        }
        let mut md = md.lock();
        md.update_object_version(obj_no, version);
        md.set_object_checksum(obj_no, version, checksum);
        Ok(())
    }

    /// Path of the currently stored file for `version` of an object.
    fn current_path(dir: &Path, md: &SharedMetadata, obj_no: u64) -> (u64, Option<PathBuf>) {
        let md = md.lock();
        let version = md.latest_object_version(obj_no);
        if version == NO_VERSION {
            return (version, None);
        }
        let checksum = md.object_checksum(obj_no, version);
        (version, Some(Self::object_path(dir, obj_no, version, checksum)))
    }

    /// Current content of an object, empty if it does not exist.
    fn current_content(old: Option<&Path>) -> OsdResult<Vec<u8>> {
        match old {
            Some(path) => match common::read_all(path) {
                Ok(data) => Ok(data),
                Err(OsdError::NotFound) => Ok(Vec::new()),
                Err(e) => Err(e),
            },
            None => Ok(Vec::new()),
        }
    }

    /// Build `FileMetadata` from the contents of a file directory.
    fn load_blocking(dir: &Path, policy: StripingPolicy) -> OsdResult<FileMetadata> {
        let mut md = FileMetadata::new(policy, VersionTable::new(dir.join(VTABLE_FILENAME)));
        md.set_truncate_epoch(common::read_u64_file(&dir.join(TEPOCH_FILENAME))?);

        // obj_no -> version -> file length
        let mut stored: BTreeMap<u64, BTreeMap<u64, u64>> = BTreeMap::new();
        for name in common::list_file_names(dir)? {
            if name.starts_with('.') {
                continue;
            }
            let Some((obj_no, version, checksum)) = common::parse_object_filename(&name) else {
                debug!("hash: skipping non-object file {}", name);
                continue;
            };
            let len = common::file_len(&dir.join(&name))?.unwrap_or(0);
            md.set_object_checksum(obj_no, version, checksum);
            md.note_stored_version(obj_no, version);
            stored.entry(obj_no).or_default().insert(version, len);
        }

        // `.curr_file_ver` is authoritative when present; otherwise the
        // largest stored version of each object is current.
        match common::read_all(&dir.join(CURRENT_VER_FILENAME)) {
            Ok(data) => {
                for (obj_no, chunk) in data.chunks_exact(8).enumerate() {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    let version = u64::from_be_bytes(bytes);
                    let obj_no = obj_no as u64;
                    if version != NO_VERSION
                        && stored.get(&obj_no).is_some_and(|v| v.contains_key(&version))
                    {
                        md.update_object_version(obj_no, version);
                    }
                }
            }
            Err(OsdError::NotFound) => {
                for (&obj_no, versions) in &stored {
                    if let Some((&version, _)) = versions.last_key_value() {
                        md.update_object_version(obj_no, version);
                    }
                }
            }
            Err(e) => return Err(e),
        }

        let last = md.latest_object_versions().map(|(o, _)| o).last();
        md.set_last_object(last);
        if let Some(last) = last {
            let version = md.latest_object_version(last);
            let len = stored
                .get(&last)
                .and_then(|v| v.get(&version))
                .copied()
                .unwrap_or(0);
            // a zero-length last object is a full stripe of padding
            let len = if len == 0 {
                policy.stripe_size_for_object(last) as u64
            } else {
                len
            };
            md.set_file_size(policy.object_start_offset(last) + len);
        }

        md.version_table_mut().load()?;
        Ok(md)
    }
}

impl Default for HashStorageLayout {
    fn default() -> Self {
        Self::from_config(&EngineConfig::new(""))
    }
}

#[async_trait]
impl StorageLayout for HashStorageLayout {
    fn name(&self) -> &str {
        "hash"
    }

    fn layout_tag(&self) -> u32 {
        HASH_LAYOUT_TAG
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
                    warn!("hash: failed to create store dir {}: {}", dir.display(), e);
                    OsdError::Eio
                })?;
            } else if !dir.is_dir() {
                warn!("hash: store dir missing at {}", dir.display());
                return Err(OsdError::NoStore);
            }
            config::ensure_layout_info(&dir, &info)
        })
        .await?;

        info!("hash: initialized store at {}", path.display());
        *self.base.write() = Some(path);
        Ok(())
    }

    async fn load_file_metadata(
        &self,
        file_id: &str,
        policy: StripingPolicy,
    ) -> OsdResult<FileMetadata> {
        let dir = self.file_dir(file_id)?;
        let md = run_blocking(move || Self::load_blocking(&dir, policy)).await?;
        debug!(
            "hash: loaded {} (size {}, last {:?}, epoch {})",
            file_id,
            md.file_size(),
            md.last_object(),
            md.truncate_epoch()
        );
        Ok(md)
    }

    async fn file_exists(&self, file_id: &str) -> OsdResult<bool> {
        let dir = self.file_dir(file_id)?;
        run_blocking(move || Ok(dir.is_dir())).await
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
        let dir = self.file_dir(file_id)?;
        let expected = md.lock().object_checksum(obj_no, version);
        let path = Self::object_path(&dir, obj_no, version, expected);
        let checksums = self.checksums;

        run_blocking(move || {
            let Some(flen) = common::file_len(&path)? else {
                debug!("hash: {} v{} not on disk", obj_no, version);
                return Ok(ObjectInformation::DoesNotExist);
            };
            if flen == 0 {
                return Ok(ObjectInformation::Padding);
            }

            let offset = offset as u64;
            if offset >= flen {
                return Ok(ObjectInformation::Exists(Vec::new()));
            }
            let avail = flen - offset;
            let len = if length == FULL_OBJECT_LENGTH {
                avail
            } else {
                avail.min(length as u64)
            };

            if checksums {
                let data = common::read_all(&path)?;
                if common::checksum(&data) != expected {
                    warn!("hash: checksum mismatch on {}", path.display());
                    return Err(OsdError::ChecksumMismatch);
                }
                let start = offset as usize;
                return Ok(ObjectInformation::Exists(
                    data[start..start + len as usize].to_vec(),
                ));
            }
            Ok(ObjectInformation::Exists(common::read_at(
                &path,
                offset,
                len as usize,
            )?))
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
        let stripe_size = md.lock().policy().stripe_size_for_object(obj_no) as usize;
        let offset = offset as usize;
        if offset + data.len() > stripe_size {
            return Err(OsdError::InvalidParms);
        }

        let dir = self.file_dir(file_id)?;
        let md = md.clone();
        let data = data.to_vec();
        let checksums = self.checksums;

        run_blocking(move || {
            let (_, old) = Self::current_path(&dir, &md, obj_no);
            let full_write = offset == 0 && data.len() == stripe_size;
            let content = if full_write {
                data
            } else {
                let mut content = Self::current_content(old.as_deref())?;
                let end = offset + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset..end].copy_from_slice(&data);
                content
            };
            Self::store_version(
                &dir, &md, obj_no, &content, new_version, old, checksums, sync, cow,
            )?;
            debug!(
                "hash: wrote {} bytes at {} to obj {} v{}",
                content.len(),
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
        let dir = self.file_dir(file_id)?;
        let md = md.clone();
        let checksums = self.checksums;

        run_blocking(move || {
            let (old_version, old) = Self::current_path(&dir, &md, obj_no);
            let mut content = Self::current_content(old.as_deref())?;
            if old_version == new_version && content.len() == new_length as usize {
                return Ok(());
            }
            content.resize(new_length as usize, 0);
            Self::store_version(
                &dir, &md, obj_no, &content, new_version, old, checksums, true, cow,
            )?;
            debug!("hash: truncated obj {} to {} (v{})", obj_no, new_length, new_version);
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
        let dir = self.file_dir(file_id)?;
        let md = md.clone();
        let checksums = self.checksums;

        run_blocking(move || {
            let checksum = if checksums {
                common::checksum(&vec![0u8; size as usize])
            } else {
                0
            };
            let path = Self::object_path(&dir, obj_no, version, checksum);
            common::atomic_create_sparse(&path, size as u64)?;
            Self::commit_version(&dir, &md, obj_no, version, checksum)?;
            debug!("hash: padding obj {} v{} ({} bytes)", obj_no, version, size);
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
        let dir = self.file_dir(file_id)?;
        let md = md.clone();

        run_blocking(move || {
            for name in common::list_file_names(&dir)? {
                if let Some((o, v, _)) = common::parse_object_filename(&name) {
                    if o == obj_no && v == version {
                        common::remove_if_exists(&dir.join(&name))?;
                    }
                }
            }
            let was_current = md.lock().latest_object_version(obj_no) == version;
            if was_current {
                Self::write_current_version(&dir, obj_no, NO_VERSION)?;
            }
            md.lock().discard_object(obj_no, version);
            debug!("hash: deleted obj {} v{}", obj_no, version);
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, file_id: &str, delete_metadata: bool) -> OsdResult<()> {
        let dir = self.file_dir(file_id)?;
        let base = self.base_path()?;
        if delete_metadata {
            self.cache.remove(file_id);
        }

        run_blocking(move || {
            for name in common::list_file_names(&dir)? {
                let is_metadata = name.starts_with('.') && !name.starts_with(".tmp_");
                if delete_metadata || !is_metadata || name == CURRENT_VER_FILENAME {
                    common::remove_if_exists(&dir.join(&name))?;
                }
            }
            if delete_metadata {
                common::prune_empty_dirs(&dir, &base);
            }
            Ok(())
        })
        .await?;

        debug!("hash: deleted file {} (metadata: {})", file_id, delete_metadata);
        Ok(())
    }

    async fn set_truncate_epoch(&self, file_id: &str, epoch: u64) -> OsdResult<()> {
        let path = self.file_dir(file_id)?.join(TEPOCH_FILENAME);
        run_blocking(move || common::write_u64_file(&path, epoch)).await
    }

    async fn update_current_obj_version(
        &self,
        file_id: &str,
        _md: &SharedMetadata,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()> {
        let dir = self.file_dir(file_id)?;
        run_blocking(move || Self::write_current_version(&dir, obj_no, version)).await
    }

    async fn update_current_version_size(
        &self,
        file_id: &str,
        last_object: Option<u64>,
    ) -> OsdResult<()> {
        let path = self.file_dir(file_id)?.join(CURRENT_VER_FILENAME);
        let len = last_object.map_or(0, |last| (last + 1) * 8);
        run_blocking(move || match common::file_len(&path)? {
            Some(cur) if cur > len => common::set_len(&path, len),
            _ => Ok(()),
        })
        .await
    }

    async fn get_object_set(&self, file_id: &str, _md: &SharedMetadata) -> OsdResult<BTreeSet<u64>> {
        let dir = self.file_dir(file_id)?;
        run_blocking(move || {
            Ok(common::list_file_names(&dir)?
                .iter()
                .filter_map(|name| common::parse_object_filename(name))
                .map(|(obj_no, _, _)| obj_no)
                .collect())
        })
        .await
    }

    async fn get_file_id_list(&self) -> OsdResult<Vec<String>> {
        let base = self.base_path()?;
        let levels = self.hash_levels();

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
                ids.extend(
                    common::list_dir_names(dir)?
                        .into_iter()
                        .filter(|name| !name.starts_with('.')),
                );
            }
            debug!("hash: found {} files", ids.len());
            Ok(ids)
        })
        .await
    }
}
