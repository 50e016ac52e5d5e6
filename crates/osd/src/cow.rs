//! Copy-on-write policy for an open file.
//!
//! The policy decides whether the next write to an object must leave the
//! previous version on disk. `CowOnce` keeps one bit per object, set while
//! the first write of the session is still pending.
//!
//! Objects outside the initialized bitmap report "not COW". Objects that
//! did not exist when the file was opened have no prior version worth
//! keeping, so this matches what the write path needs, but it means the
//! answer for an out-of-range object differs from an in-range object that
//! was never written.

use std::fmt;
use std::str::FromStr;

use bitvec::prelude::*;
use osd_proto::error::OsdError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Copy-on-write mode chosen when a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CowMode {
    /// Mutate objects in place.
    #[default]
    NoCow,
    /// Every write creates a new object version.
    AlwaysCow,
    /// Only the first write to each object after open creates a new version.
    CowOnce,
}

impl fmt::Display for CowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CowMode::NoCow => "no-cow",
            CowMode::AlwaysCow => "always-cow",
            CowMode::CowOnce => "cow-once",
        };
        f.write_str(s)
    }
}

impl FromStr for CowMode {
    type Err = OsdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-cow" | "none" => Ok(CowMode::NoCow),
            "always-cow" | "always" => Ok(CowMode::AlwaysCow),
            "cow-once" | "once" => Ok(CowMode::CowOnce),
            _ => Err(OsdError::InvalidParms),
        }
    }
}

/// Per-open copy-on-write state.
#[derive(Debug)]
pub struct CowPolicy {
    mode: CowMode,
    /// Pending-COW bits for `CowOnce`; `None` until sized.
    flags: Mutex<Option<BitVec<u8, Lsb0>>>,
}

impl CowPolicy {
    pub fn new(mode: CowMode) -> Self {
        Self {
            mode,
            flags: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> CowMode {
        self.mode
    }

    /// Whether old object versions are ever preserved under this policy.
    pub fn cow_enabled(&self) -> bool {
        self.mode != CowMode::NoCow
    }

    /// Size the `CowOnce` bitmap to `object_count` objects, all pending.
    ///
    /// Only the first call has an effect; the bitmap describes the objects
    /// that existed when the file was first written in this session.
    pub fn init_cow_flags_if_required(&self, object_count: u64) {
        if self.mode != CowMode::CowOnce {
            return;
        }
        let mut flags = self.flags.lock();
        if flags.is_none() {
            *flags = Some(bitvec![u8, Lsb0; 1; object_count as usize]);
        }
    }

    /// Whether the next write to `obj_no` must preserve the current version.
    pub fn is_cow(&self, obj_no: u64) -> bool {
        match self.mode {
            CowMode::NoCow => false,
            CowMode::AlwaysCow => true,
            CowMode::CowOnce => {
                let flags = self.flags.lock();
                flags
                    .as_ref()
                    .and_then(|f| f.get(obj_no as usize).map(|b| *b))
                    .unwrap_or(false)
            }
        }
    }

    /// Record that `obj_no` has been written. Only `CowOnce` tracks this.
    pub fn object_changed(&self, obj_no: u64) {
        if self.mode != CowMode::CowOnce {
            return;
        }
        let mut flags = self.flags.lock();
        if let Some(f) = flags.as_mut() {
            if (obj_no as usize) < f.len() {
                f.set(obj_no as usize, false);
            }
        }
    }
}

impl Default for CowPolicy {
    fn default() -> Self {
        Self::new(CowMode::NoCow)
    }
}
