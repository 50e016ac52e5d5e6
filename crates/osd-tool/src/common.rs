//! Shared utilities for the osd-tool CLI.
//!
//! Opening a storage directory and the formatting helpers used by every
//! subcommand.

use std::path::Path;

use osd::config::load_layout_info;
use osd::{EngineConfig, StorageEngine};
use osd_proto::error::OsdResult;
use osd_proto::StripingPolicy;

/// Open the storage directory at `dir`.
///
/// Without an explicit `layout` the one recorded in the directory is used.
pub async fn open_engine(dir: &Path, layout: Option<&str>) -> OsdResult<StorageEngine> {
    let layout = match layout {
        Some(name) => name.to_string(),
        None => match load_layout_info(dir)? {
            Some(info) => info.name,
            None => exit_error(&format!("{} is not an initialized storage directory", dir.display())),
        },
    };
    let cfg = EngineConfig::new(dir).with_layout(&layout);
    StorageEngine::open(cfg, false).await
}

/// Build the striping policy given on the command line or exit.
pub fn striping_policy(stripe_size: &str, width: u32) -> StripingPolicy {
    let size = match parse_size(stripe_size) {
        Ok(size) => size,
        Err(e) => exit_error(&e),
    };
    let size = match u32::try_from(size) {
        Ok(size) => size,
        Err(_) => exit_error(&format!("stripe size '{}' too large", stripe_size)),
    };
    match StripingPolicy::new(size, width) {
        Ok(policy) => policy,
        Err(e) => exit_error(&format!("invalid striping policy: {}", e)),
    }
}

/// Human-readable size with one decimal, e.g. "128.0 KB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Version table timestamp (ms) as `YYYY-MM-DD hh:mm:ss.mmm` UTC.
pub fn format_millis(epoch_millis: u64) -> String {
    if epoch_millis == 0 {
        return "-".to_string();
    }
    let secs = epoch_millis / 1000;
    let (year, month, day) = utc_date(secs / 86_400);
    let time = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        year,
        month,
        day,
        time / 3600,
        time % 3600 / 60,
        time % 60,
        epoch_millis % 1000
    )
}

fn is_leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// (year, month, day) of the day `days` after 1970-01-01.
fn utc_date(mut days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    loop {
        let year_len = if is_leap_year(year) { 366 } else { 365 };
        if days < year_len {
            break;
        }
        days -= year_len;
        year += 1;
    }
    let february = if is_leap_year(year) { 29 } else { 28 };
    let mut month = 1;
    for month_len in [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31] {
        if days < month_len {
            break;
        }
        days -= month_len;
        month += 1;
    }
    (year, month, days + 1)
}

/// Parse a stripe size such as "4096", "128K" or "1M".
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let shift = match suffix {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        _ => return Err(format!("invalid size suffix in '{}'", s)),
    };
    let num: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", s))?;
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
