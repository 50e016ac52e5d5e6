//! RAID0-style striping arithmetic.
//!
//! A file is cut into objects of `stripe_size` bytes. Object `n` belongs to
//! node `n % width` of the file's stripe, and rows group `width`
//! consecutive objects. All functions are pure so that every node holding
//! part of a file derives the same placement from the same descriptor.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_STRIPE_SIZE, MAX_STRIPE_SIZE, MIN_STRIPE_SIZE};
use crate::error::{OsdError, OsdResult};

/// Striping descriptor assigned to a file at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripingPolicy {
    /// Object size in bytes.
    pub stripe_size: u32,
    /// Number of nodes the file is striped over.
    pub width: u32,
}

impl StripingPolicy {
    /// Create a validated policy.
    pub fn new(stripe_size: u32, width: u32) -> OsdResult<Self> {
        if !(MIN_STRIPE_SIZE..=MAX_STRIPE_SIZE).contains(&stripe_size) || width == 0 {
            return Err(OsdError::InvalidParms);
        }
        Ok(Self { stripe_size, width })
    }

    /// Expected size of object `obj_no`. Constant across a file.
    pub fn stripe_size_for_object(&self, _obj_no: u64) -> u32 {
        self.stripe_size
    }

    /// Index of the node within the stripe that owns `obj_no`.
    pub fn object_owner(&self, obj_no: u64) -> u32 {
        (obj_no % self.width as u64) as u32
    }

    /// Whether `obj_no` is stored on the node at `node_index`.
    pub fn is_local_object(&self, obj_no: u64, node_index: u32) -> bool {
        self.object_owner(obj_no) == node_index
    }

    /// Stripe row containing `obj_no`.
    pub fn row(&self, obj_no: u64) -> u64 {
        obj_no / self.width as u64
    }

    /// Object number of the object owned by `node_index` in `row`.
    pub fn object_in_row(&self, row: u64, node_index: u32) -> u64 {
        row * self.width as u64 + node_index as u64
    }

    /// Object containing byte `offset` of the file.
    pub fn object_no_for_offset(&self, offset: u64) -> u64 {
        offset / self.stripe_size as u64
    }

    /// First byte offset of `obj_no` within the file.
    pub fn object_start_offset(&self, obj_no: u64) -> u64 {
        obj_no * self.stripe_size as u64
    }

    /// Last byte offset of `obj_no` within the file (inclusive).
    pub fn object_end_offset(&self, obj_no: u64) -> u64 {
        self.object_start_offset(obj_no) + self.stripe_size as u64 - 1
    }

    /// Last object of a file of `file_size` bytes, `None` for an empty file.
    pub fn last_object(&self, file_size: u64) -> Option<u64> {
        if file_size == 0 {
            None
        } else {
            Some(self.object_no_for_offset(file_size - 1))
        }
    }

    /// Actual length of `obj_no` in a file of `file_size` bytes.
    ///
    /// Every object but the last is a full stripe; the last may be shorter.
    /// Objects past the end of the file have length 0.
    pub fn object_size_in_file(&self, obj_no: u64, file_size: u64) -> u32 {
        let start = self.object_start_offset(obj_no);
        if file_size <= start {
            0
        } else {
            (file_size - start).min(self.stripe_size as u64) as u32
        }
    }
}

impl Default for StripingPolicy {
    fn default() -> Self {
        Self {
            stripe_size: DEFAULT_STRIPE_SIZE,
            width: 1,
        }
    }
}

impl std::fmt::Display for StripingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RAID0,{}k,{}", self.stripe_size / 1024, self.width)
    }
}
