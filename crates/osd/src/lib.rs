//! # osd
//!
//! Per-node object storage engine.
//!
//! Files are split into striped objects; this crate stores the objects a
//! node owns, keeps their historical versions for snapshot reads, applies
//! copy-on-write policies and manages the open/close lifecycle of files.
//! Two storage layouts share one [`storage::StorageLayout`] contract: one
//! file per object version (`hash`) and one container per file (`single`).

pub mod cleanup;
pub mod config;
pub mod cow;
pub mod engine;
pub mod locks;
pub mod open_files;
pub mod storage;
pub mod version_table;

pub use config::EngineConfig;
pub use cow::{CowMode, CowPolicy};
pub use engine::{CloseListener, CloseReason, ClosedFile, ReadVersion, StorageEngine};
pub use storage::{ObjectInformation, StorageLayout};
