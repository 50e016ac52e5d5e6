//! File subcommands for osd-tool.
//!
//! Inspect and maintain the files held in one storage directory: list
//! files and their objects, show version tables and sizes, prune
//! snapshots and delete files.

use std::collections::BTreeSet;

use tabled::{Table, Tabled};

use osd::{ReadVersion, StorageEngine};
use osd_proto::StripingPolicy;

use crate::common::{exit_error, format_millis, format_size};

// ---------------------------------------------------------------------------
// Table display types
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "File Id")]
    file_id: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Objects")]
    objects: usize,
    #[tabled(rename = "Versions")]
    versions: usize,
    #[tabled(rename = "Truncate Epoch")]
    truncate_epoch: u64,
}

#[derive(Tabled)]
struct ObjectRow {
    #[tabled(rename = "Object")]
    obj_no: u64,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Largest")]
    largest: u64,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

#[derive(Tabled)]
struct VersionRow {
    #[tabled(rename = "Timestamp")]
    timestamp: u64,
    #[tabled(rename = "Time (UTC)")]
    time: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Object Versions")]
    objects: String,
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// List every file in the storage directory.
pub async fn file_list(engine: &StorageEngine, policy: StripingPolicy) {
    let file_ids = match engine.file_id_list().await {
        Ok(ids) => ids,
        Err(e) => exit_error(&format!("Failed to list files: {}", e)),
    };
    if file_ids.is_empty() {
        println!("No files in the storage directory.");
        return;
    }

    let mut rows = Vec::with_capacity(file_ids.len());
    for file_id in file_ids {
        let md = match engine.layout().get_file_metadata(policy, &file_id).await {
            Ok(md) => md,
            Err(e) => exit_error(&format!("Failed to load {}: {}", file_id, e)),
        };
        let objects = match engine.layout().get_object_set(&file_id, &md).await {
            Ok(set) => set.len(),
            Err(e) => exit_error(&format!("Failed to scan {}: {}", file_id, e)),
        };
        let md = md.lock();
        rows.push(FileRow {
            size: format_size(md.file_size()),
            objects,
            versions: md.version_table().len(),
            truncate_epoch: md.truncate_epoch(),
            file_id,
        });
    }

    println!("{}", Table::new(&rows));
    println!();
    println!("Total {} file(s)", rows.len());
}

/// List the objects of one file with their versions.
pub async fn object_list(engine: &StorageEngine, policy: StripingPolicy, file_id: &str) {
    let md = match engine.layout().get_file_metadata(policy, file_id).await {
        Ok(md) => md,
        Err(e) => exit_error(&format!("Failed to load {}: {}", file_id, e)),
    };
    let objects = match engine.layout().get_object_set(file_id, &md).await {
        Ok(set) => set,
        Err(e) => exit_error(&format!("Failed to scan {}: {}", file_id, e)),
    };
    if objects.is_empty() {
        println!("No objects stored for {}.", file_id);
        return;
    }

    let md = md.lock();
    let rows: Vec<ObjectRow> = objects
        .into_iter()
        .map(|obj_no| {
            let current = md.latest_object_version(obj_no);
            ObjectRow {
                obj_no,
                current: if current == 0 {
                    "-".to_string()
                } else {
                    current.to_string()
                },
                largest: md.largest_object_version(obj_no),
                checksum: match md.object_checksum(obj_no, current) {
                    0 => "-".to_string(),
                    sum => format!("{:08x}", sum),
                },
            }
        })
        .collect();

    println!("{}", Table::new(&rows));
    println!();
    println!("Total {} object(s)", rows.len());
}

/// Show the snapshots recorded for one file.
pub async fn version_list(engine: &StorageEngine, policy: StripingPolicy, file_id: &str) {
    let md = match engine.layout().get_file_metadata(policy, file_id).await {
        Ok(md) => md,
        Err(e) => exit_error(&format!("Failed to load {}: {}", file_id, e)),
    };
    let md = md.lock();
    let table = md.version_table();
    if table.is_empty() {
        println!("No versions recorded for {}.", file_id);
        return;
    }

    let rows: Vec<VersionRow> = table
        .versions()
        .map(|v| VersionRow {
            timestamp: v.timestamp,
            time: format_millis(v.timestamp),
            size: format_size(v.file_size),
            objects: v
                .object_versions
                .iter()
                .map(|(obj_no, ver)| format!("{}:{}", obj_no, ver))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect();

    println!("{}", Table::new(&rows));
}

/// Print the size of a file, now or as of a snapshot timestamp (ms).
pub async fn file_size(
    engine: &StorageEngine,
    policy: StripingPolicy,
    file_id: &str,
    at: Option<u64>,
) {
    let version = at.map_or(ReadVersion::Latest, ReadVersion::Snapshot);
    match engine.file_size(file_id, policy, version).await {
        Ok(size) => println!("{} ({} bytes)", format_size(size), size),
        Err(e) => exit_error(&format!("Failed to get size of {}: {}", file_id, e)),
    }
}

/// Drop every snapshot of a file except the `keep` timestamps.
pub async fn prune(engine: &StorageEngine, policy: StripingPolicy, file_id: &str, keep: Vec<u64>) {
    let retained: BTreeSet<u64> = keep.into_iter().collect();
    match engine.cleanup_versions(file_id, policy, &retained).await {
        Ok(report) if report.snapshots_dropped == 0 => {
            println!("Nothing to prune in {}", file_id);
        }
        Ok(report) => println!(
            "Pruned {}: {} snapshot(s) dropped, {} object version(s) deleted",
            file_id, report.snapshots_dropped, report.objects_deleted
        ),
        Err(e) => exit_error(&format!("Failed to prune {}: {}", file_id, e)),
    }
}

/// Delete a file with all its objects and metadata.
pub async fn delete(engine: &StorageEngine, file_id: &str) {
    match engine.file_id_list().await {
        Ok(ids) if !ids.iter().any(|id| id == file_id) => {
            exit_error(&format!("File {} not found", file_id));
        }
        Ok(_) => {}
        Err(e) => exit_error(&format!("Failed to list files: {}", e)),
    }
    match engine.delete_file(file_id).await {
        Ok(_) => println!("Deleted {}", file_id),
        Err(e) => exit_error(&format!("Failed to delete {}: {}", file_id, e)),
    }
}
