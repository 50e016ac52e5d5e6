//! Storage layout abstraction.
//!
//! The `StorageLayout` trait defines how object versions of a file are laid
//! out on the local disk. Callers address objects by `(file_id, obj_no,
//! version)` and never see paths.
//!
//! Available layouts:
//! - **hash**: one file per object version under
//!   `{base}/{h1}/{h2}/.../{file_id}/{obj}{ver}{checksum}`
//! - **single**: all objects of a file in one container
//!   `{base}/{h1}/{h2}/{file_id}.data` with a per-row record file
//!
//! Both layouts keep per-file metadata in memory (`FileMetadata`) and share
//! the same LRU of loaded metadata through `get_file_metadata`.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use osd_proto::error::OsdResult;
use osd_proto::striping::StripingPolicy;

use crate::config::EngineConfig;

pub use metadata::{FileMetadata, SharedMetadata};
pub use metadata_cache::MetadataCache;

/// Result of reading one object version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectInformation {
    /// Stored bytes of the requested range. May be shorter than requested
    /// when the object itself is shorter.
    Exists(Vec<u8>),
    /// The object is logically all zeros.
    Padding,
    /// The object was never written or has been removed.
    DoesNotExist,
}

impl ObjectInformation {
    pub fn data(&self) -> &[u8] {
        match self {
            ObjectInformation::Exists(data) => data,
            _ => &[],
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, ObjectInformation::DoesNotExist)
    }

    /// Bytes of this object zero-extended to `len`. Longer data is kept.
    pub fn into_padded(self, len: usize) -> Vec<u8> {
        let mut data = match self {
            ObjectInformation::Exists(data) => data,
            _ => Vec::new(),
        };
        if data.len() < len {
            data.resize(len, 0);
        }
        data
    }
}

/// Trait that all storage layouts must implement.
///
/// Every method that performs filesystem I/O runs it on the blocking pool.
/// Callers serialize operations on the same `(file_id, obj_no)`; the
/// layout must tolerate concurrent operations on different objects of the
/// same file.
#[async_trait]
pub trait StorageLayout: Send + Sync {
    /// Human-readable name of this layout (e.g. "hash", "single").
    fn name(&self) -> &str;

    /// Tag recorded in the storage directory by this layout.
    fn layout_tag(&self) -> u32;

    /// Cache of loaded file metadata.
    fn metadata_cache(&self) -> &MetadataCache;

    /// Initialize the layout at `path`.
    ///
    /// If `first_time` is true, the directory is created. Otherwise it must
    /// exist. Either way the stored layout tag must match this layout.
    async fn init(&self, path: &Path, first_time: bool) -> OsdResult<()>;

    /// Build the metadata of `file_id` from disk. A file that has never
    /// been written yields empty metadata; nothing is created on disk.
    async fn load_file_metadata(
        &self,
        file_id: &str,
        policy: StripingPolicy,
    ) -> OsdResult<FileMetadata>;

    /// Cached metadata of `file_id`, loading and caching it on first use.
    async fn get_file_metadata(
        &self,
        policy: StripingPolicy,
        file_id: &str,
    ) -> OsdResult<SharedMetadata> {
        if let Some(md) = self.metadata_cache().get(file_id) {
            return Ok(md);
        }
        let md = self.load_file_metadata(file_id, policy).await?.into_shared();
        Ok(self.metadata_cache().insert(file_id, md))
    }

    /// Cached metadata if present, otherwise freshly loaded without caching.
    async fn get_file_metadata_no_caching(
        &self,
        policy: StripingPolicy,
        file_id: &str,
    ) -> OsdResult<SharedMetadata> {
        if let Some(md) = self.metadata_cache().get(file_id) {
            return Ok(md);
        }
        Ok(self.load_file_metadata(file_id, policy).await?.into_shared())
    }

    /// Whether anything is stored for `file_id`.
    async fn file_exists(&self, file_id: &str) -> OsdResult<bool>;

    /// Read `length` bytes at `offset` of `version` of an object.
    ///
    /// `length` may be [`osd_proto::constants::FULL_OBJECT_LENGTH`]. Version
    /// 0 and missing versions are `DoesNotExist`; a zero-length object is
    /// `Padding`. With checksums enabled a corrupt object fails with
    /// `ChecksumMismatch`.
    async fn read_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        offset: u32,
        length: u32,
        version: u64,
    ) -> OsdResult<ObjectInformation>;

    /// Write `data` at `offset` into an object, producing `new_version`.
    ///
    /// Bytes between the old end of the object and `offset` read as zeros.
    /// When `cow` is set the previous version stays on disk. The new
    /// version becomes current only after its data is stored.
    #[allow(clippy::too_many_arguments)]
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
    ) -> OsdResult<()>;

    /// Shrink or zero-extend an object to exactly `new_length` bytes as
    /// `new_version`.
    async fn truncate_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        new_length: u32,
        new_version: u64,
        cow: bool,
    ) -> OsdResult<()>;

    /// Create `version` of an object as `size` zero bytes.
    async fn create_padding_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
        size: u32,
    ) -> OsdResult<()>;

    /// Remove one version of an object.
    async fn delete_object(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()>;

    /// Remove all objects of a file, and with `delete_metadata` its epoch,
    /// version table and directory as well.
    async fn delete_file(&self, file_id: &str, delete_metadata: bool) -> OsdResult<()>;

    /// Persist the truncate epoch of a file.
    async fn set_truncate_epoch(&self, file_id: &str, epoch: u64) -> OsdResult<()>;

    /// Record `version` as the current version of `obj_no`. Recording
    /// [`osd_proto::constants::NO_VERSION`] retires the current version
    /// without deleting it.
    async fn update_current_obj_version(
        &self,
        file_id: &str,
        md: &SharedMetadata,
        obj_no: u64,
        version: u64,
    ) -> OsdResult<()>;

    /// Drop current-version records past `last_object`.
    async fn update_current_version_size(
        &self,
        file_id: &str,
        last_object: Option<u64>,
    ) -> OsdResult<()>;

    /// Object numbers with at least one version on disk.
    async fn get_object_set(&self, file_id: &str, md: &SharedMetadata) -> OsdResult<BTreeSet<u64>>;

    /// Every file ID stored by this layout. Scans the whole store.
    async fn get_file_id_list(&self) -> OsdResult<Vec<String>>;
}

/// Get a storage layout by name, configured from `cfg`.
pub fn get_layout(name: &str, cfg: &EngineConfig) -> Option<Box<dyn StorageLayout>> {
    match name {
        "hash" => Some(Box::new(hash_layout::HashStorageLayout::from_config(cfg))),
        "single" => Some(Box::new(single_file::SingleFileStorageLayout::from_config(cfg))),
        _ => None,
    }
}

/// List all available layout names.
pub fn available_layouts() -> Vec<&'static str> {
    vec!["hash", "single"]
}

pub mod common;
pub mod hash_layout;
pub mod metadata;
pub mod metadata_cache;
pub mod single_file;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_layout() {
        let cfg = EngineConfig::new("/tmp/unused");
        for name in available_layouts() {
            let layout = get_layout(name, &cfg).unwrap();
            assert_eq!(layout.name(), name);
        }
        assert!(get_layout("btree", &cfg).is_none());
    }

    #[test]
    fn test_object_information_padding() {
        assert_eq!(ObjectInformation::Padding.into_padded(4), vec![0; 4]);
        assert_eq!(
            ObjectInformation::Exists(vec![1, 2]).into_padded(4),
            vec![1, 2, 0, 0]
        );
        assert_eq!(
            ObjectInformation::Exists(vec![1, 2, 3]).into_padded(2),
            vec![1, 2, 3]
        );
        assert!(!ObjectInformation::DoesNotExist.exists());
        assert!(ObjectInformation::Padding.data().is_empty());
    }

    /// Behaviour every layout must share, instantiated once per layout.
    macro_rules! layout_conformance_tests {
        ($modname:ident, $layout:expr) => {
            mod $modname {
                use super::super::*;
                use osd_proto::constants::FULL_OBJECT_LENGTH;
                use osd_proto::error::OsdError;
                use std::path::PathBuf;

                const STRIPE: u32 = 4096;

                fn policy() -> StripingPolicy {
                    StripingPolicy::new(STRIPE, 1).unwrap()
                }

                async fn setup(name: &str, checksums: bool) -> (Box<dyn StorageLayout>, PathBuf) {
                    let tmp = std::env::temp_dir()
                        .join(format!("osd_conformance_{}_{}", stringify!($modname), name));
                    let _ = std::fs::remove_dir_all(&tmp);
                    let cfg = EngineConfig::new(&tmp).with_checksums(checksums);
                    let layout: Box<dyn StorageLayout> = Box::new(($layout)(&cfg));
                    layout.init(&tmp, true).await.unwrap();
                    (layout, tmp)
                }

                /// Flip the first byte of `needle` in every stored file
                /// under `dir` that holds it. Returns the number of files.
                fn corrupt_stored_bytes(dir: &std::path::Path, needle: &[u8]) -> usize {
                    let mut corrupted = 0;
                    let mut pending = vec![dir.to_path_buf()];
                    while let Some(dir) = pending.pop() {
                        for entry in std::fs::read_dir(&dir).unwrap() {
                            let path = entry.unwrap().path();
                            if path.is_dir() {
                                pending.push(path);
                                continue;
                            }
                            let mut data = std::fs::read(&path).unwrap();
                            if let Some(pos) = data.windows(needle.len()).position(|w| w == needle) {
                                data[pos] ^= 0x20;
                                std::fs::write(&path, &data).unwrap();
                                corrupted += 1;
                            }
                        }
                    }
                    corrupted
                }

                async fn read_all(
                    layout: &dyn StorageLayout,
                    file_id: &str,
                    md: &SharedMetadata,
                    obj_no: u64,
                ) -> ObjectInformation {
                    let version = md.lock().latest_object_version(obj_no);
                    layout
                        .read_object(file_id, md, obj_no, 0, FULL_OBJECT_LENGTH, version)
                        .await
                        .unwrap()
                }

                #[tokio::test]
                async fn test_read_after_write() {
                    let (layout, tmp) = setup("raw", false).await;
                    let md = layout.get_file_metadata(policy(), "f:1").await.unwrap();

                    let data = vec![0xab; STRIPE as usize];
                    layout
                        .write_object("f:1", &md, &data, 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    assert_eq!(md.lock().latest_object_version(0), 1);
                    assert_eq!(read_all(&*layout, "f:1", &md, 0).await.data(), &data[..]);

                    // ranged read
                    let part = layout.read_object("f:1", &md, 0, 10, 5, 1).await.unwrap();
                    assert_eq!(part.data(), &[0xab; 5]);

                    // offset past the end of the object
                    layout
                        .write_object("f:1", &md, b"xy", 1, 0, 1, true, false)
                        .await
                        .unwrap();
                    let past = layout.read_object("f:1", &md, 1, 100, 5, 1).await.unwrap();
                    assert_eq!(past, ObjectInformation::Exists(Vec::new()));

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_partial_write_zero_fills_hole() {
                    let (layout, tmp) = setup("hole", false).await;
                    let md = layout.get_file_metadata(policy(), "f:2").await.unwrap();

                    layout
                        .write_object("f:2", &md, b"abc", 0, 100, 1, true, false)
                        .await
                        .unwrap();
                    let data = read_all(&*layout, "f:2", &md, 0).await.into_padded(0);
                    assert_eq!(data.len(), 103);
                    assert!(data[..100].iter().all(|&b| b == 0));
                    assert_eq!(&data[100..], b"abc");

                    // unwritten objects do not exist
                    let missing = layout
                        .read_object("f:2", &md, 1, 0, FULL_OBJECT_LENGTH, 0)
                        .await
                        .unwrap();
                    assert_eq!(missing, ObjectInformation::DoesNotExist);
                    let missing = layout
                        .read_object("f:2", &md, 1, 0, FULL_OBJECT_LENGTH, 7)
                        .await
                        .unwrap();
                    assert_eq!(missing, ObjectInformation::DoesNotExist);

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_truncate_then_read() {
                    let (layout, tmp) = setup("trunc", false).await;
                    let md = layout.get_file_metadata(policy(), "f:3").await.unwrap();

                    let original: Vec<u8> = (0..64u8).collect();
                    layout
                        .write_object("f:3", &md, &original, 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    layout.truncate_object("f:3", &md, 0, 32, 1, false).await.unwrap();
                    assert_eq!(read_all(&*layout, "f:3", &md, 0).await.data(), &original[..32]);

                    layout.truncate_object("f:3", &md, 0, 64, 1, false).await.unwrap();
                    let data = read_all(&*layout, "f:3", &md, 0).await.into_padded(0);
                    assert_eq!(data.len(), 64);
                    assert_eq!(&data[..32], &original[..32]);
                    assert!(data[32..].iter().all(|&b| b == 0));

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_cow_keeps_old_version() {
                    let (layout, tmp) = setup("cow", false).await;
                    let md = layout.get_file_metadata(policy(), "f:4").await.unwrap();

                    layout
                        .write_object("f:4", &md, b"old", 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    layout
                        .write_object("f:4", &md, b"N", 0, 0, 2, true, true)
                        .await
                        .unwrap();
                    assert_eq!(md.lock().latest_object_version(0), 2);

                    let v1 = layout.read_object("f:4", &md, 0, 0, FULL_OBJECT_LENGTH, 1).await.unwrap();
                    let v2 = layout.read_object("f:4", &md, 0, 0, FULL_OBJECT_LENGTH, 2).await.unwrap();
                    assert_eq!(v1.data(), b"old");
                    assert_eq!(v2.data(), b"Nld");

                    layout.delete_object("f:4", &md, 0, 1).await.unwrap();
                    let v1 = layout.read_object("f:4", &md, 0, 0, FULL_OBJECT_LENGTH, 1).await.unwrap();
                    assert_eq!(v1, ObjectInformation::DoesNotExist);
                    let v2 = layout.read_object("f:4", &md, 0, 0, FULL_OBJECT_LENGTH, 2).await.unwrap();
                    assert_eq!(v2.data(), b"Nld");

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_padding_object() {
                    let (layout, tmp) = setup("pad", false).await;
                    let md = layout.get_file_metadata(policy(), "f:5").await.unwrap();

                    layout.create_padding_object("f:5", &md, 2, 1, STRIPE).await.unwrap();
                    let data = read_all(&*layout, "f:5", &md, 2).await.into_padded(STRIPE as usize);
                    assert_eq!(data, vec![0; STRIPE as usize]);

                    layout.create_padding_object("f:5", &md, 3, 1, 0).await.unwrap();
                    assert_eq!(read_all(&*layout, "f:5", &md, 3).await, ObjectInformation::Padding);

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_object_set_and_file_id_list() {
                    let (layout, tmp) = setup("list", false).await;
                    assert!(layout.get_file_id_list().await.unwrap().is_empty());

                    for file_id in ["vol:a", "vol:b", "vol:c"] {
                        let md = layout.get_file_metadata(policy(), file_id).await.unwrap();
                        for obj_no in [0, 3, 5] {
                            layout
                                .write_object(file_id, &md, b"z", obj_no, 0, 1, true, false)
                                .await
                                .unwrap();
                        }
                    }

                    let md = layout.get_file_metadata(policy(), "vol:b").await.unwrap();
                    let objs = layout.get_object_set("vol:b", &md).await.unwrap();
                    assert_eq!(objs.into_iter().collect::<Vec<_>>(), vec![0, 3, 5]);

                    let mut ids = layout.get_file_id_list().await.unwrap();
                    ids.sort();
                    assert_eq!(ids, vec!["vol:a", "vol:b", "vol:c"]);

                    assert!(layout.file_exists("vol:a").await.unwrap());
                    layout.delete_file("vol:a", true).await.unwrap();
                    assert!(!layout.file_exists("vol:a").await.unwrap());
                    let ids = layout.get_file_id_list().await.unwrap();
                    assert_eq!(ids.len(), 2);

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_metadata_reload() {
                    let (layout, tmp) = setup("reload", false).await;
                    let md = layout.get_file_metadata(policy(), "f:6").await.unwrap();

                    layout
                        .write_object("f:6", &md, &[1; STRIPE as usize], 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    layout
                        .write_object("f:6", &md, &[2; 10], 2, 0, 1, true, false)
                        .await
                        .unwrap();
                    layout
                        .write_object("f:6", &md, &[3; 5], 2, 0, 2, true, true)
                        .await
                        .unwrap();
                    layout.set_truncate_epoch("f:6", 7).await.unwrap();

                    let loaded = layout.load_file_metadata("f:6", policy()).await.unwrap();
                    assert_eq!(loaded.truncate_epoch(), 7);
                    assert_eq!(loaded.latest_object_version(0), 1);
                    assert_eq!(loaded.latest_object_version(1), 0);
                    assert_eq!(loaded.latest_object_version(2), 2);
                    assert_eq!(loaded.largest_object_version(2), 2);
                    assert_eq!(loaded.last_object(), Some(2));
                    assert_eq!(loaded.file_size(), 2 * STRIPE as u64 + 10);

                    let fresh = layout.load_file_metadata("f:none", policy()).await.unwrap();
                    assert_eq!(fresh.last_object(), None);
                    assert_eq!(fresh.file_size(), 0);
                    assert!(!layout.file_exists("f:none").await.unwrap());

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_delete_file_keeps_metadata() {
                    let (layout, tmp) = setup("keepmd", false).await;
                    let md = layout.get_file_metadata(policy(), "f:7").await.unwrap();
                    layout
                        .write_object("f:7", &md, b"abc", 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    layout.set_truncate_epoch("f:7", 3).await.unwrap();

                    layout.delete_file("f:7", false).await.unwrap();
                    let loaded = layout.load_file_metadata("f:7", policy()).await.unwrap();
                    assert_eq!(loaded.truncate_epoch(), 3);
                    assert_eq!(loaded.latest_object_version(0), 0);
                    assert!(layout.get_object_set("f:7", &md).await.unwrap().is_empty());

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_checksum_mismatch_detected() {
                    let (layout, tmp) = setup("crc", true).await;
                    let md = layout.get_file_metadata(policy(), "f:8").await.unwrap();
                    layout
                        .write_object("f:8", &md, b"payload", 0, 0, 1, true, false)
                        .await
                        .unwrap();
                    assert_eq!(read_all(&*layout, "f:8", &md, 0).await.data(), b"payload");

                    assert_eq!(corrupt_stored_bytes(&tmp, b"payload"), 1);
                    let res = layout
                        .read_object("f:8", &md, 0, 0, FULL_OBJECT_LENGTH, 1)
                        .await;
                    assert_eq!(res, Err(OsdError::ChecksumMismatch));
                    let res = layout.read_object("f:8", &md, 0, 2, 3, 1).await;
                    assert_eq!(res, Err(OsdError::ChecksumMismatch));

                    let _ = std::fs::remove_dir_all(&tmp);
                }

                #[tokio::test]
                async fn test_init_rejects_foreign_layout() {
                    let (layout, tmp) = setup("foreign", false).await;
                    layout.init(&tmp, false).await.unwrap();
                    let other = if layout.name() == "hash" { "single" } else { "hash" };
                    let foreign = get_layout(other, &EngineConfig::new(&tmp)).unwrap();
                    assert_eq!(
                        foreign.init(&tmp, false).await,
                        Err(OsdError::LayoutMismatch)
                    );

                    let missing = tmp.join("missing");
                    assert_eq!(layout.init(&missing, false).await, Err(OsdError::NoStore));

                    let _ = std::fs::remove_dir_all(&tmp);
                }
            }
        };
    }

    layout_conformance_tests!(hash_conformance, hash_layout::HashStorageLayout::from_config);
    layout_conformance_tests!(single_conformance, single_file::SingleFileStorageLayout::from_config);
}
