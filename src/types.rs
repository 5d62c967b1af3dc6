//! Core type definitions for the Strata extent lock manager.
//!
//! This module contains the identifiers and the byte-range type shared by
//! every other module.
//!
//! # Key Types
//!
//! - [`ResourceId`]: Stable identity of a lockable object
//! - [`LockId`]: Handle of a lock record inside its resource
//! - [`ExportId`]: Identity of the client connection that owns a lock
//! - [`Extent`]: Inclusive byte range `[start, end]`
//!
//! # Type Aliases
//!
//! - [`Gid`] = `u64`: Group lock identifier
//!
//! # Examples
//!
//! ```rust
//! use strata_delm::types::{Extent, OBJECT_EOF};
//!
//! let page = Extent::new(0, 4095).unwrap();
//! assert_eq!(page.len(), 4096);
//! assert!(page.overlaps(&Extent::new(4095, 8191).unwrap()));
//! assert!(Extent::WHOLE_FILE.contains(&page));
//! assert_eq!(Extent::WHOLE_FILE.end, OBJECT_EOF);
//!
//! // Reversed ranges are rejected.
//! assert!(Extent::new(10, 9).is_err());
//! ```

use crate::error::{DelmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest addressable byte offset of an object.
pub const OBJECT_EOF: u64 = u64::MAX;

/// Group lock identifier.
pub type Gid = u64;

/// Identity of a lockable object (file stripe object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Object sequence (namespace of the object id).
    pub seq: u64,
    /// Object id within the sequence.
    pub oid: u64,
}

impl ResourceId {
    pub fn new(seq: u64, oid: u64) -> Self {
        Self { seq, oid }
    }

    /// Shard index used by the registry.
    pub(crate) fn bucket(&self, bits: u32) -> usize {
        let mut h = self.oid ^ self.seq.rotate_left(32);
        // fmix64
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        h ^= h >> 33;
        if bits == 0 {
            0
        } else {
            (h >> (64 - bits)) as usize
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.seq, self.oid)
    }
}

/// Handle of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// Client connection (export) that owns a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportId(pub u64);

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export#{}", self.0)
    }
}

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    /// `[0, EOF]`.
    pub const WHOLE_FILE: Extent = Extent {
        start: 0,
        end: OBJECT_EOF,
    };

    /// Create an extent, rejecting `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(DelmError::InvalidExtent { start, end });
        }
        Ok(Self { start, end })
    }

    /// Extent covering `length` bytes from `offset`. A zero length means
    /// "to end of file".
    pub fn from_offset(offset: u64, length: u64) -> Self {
        let end = if length == 0 {
            OBJECT_EOF
        } else {
            offset.saturating_add(length - 1)
        };
        Self { start: offset, end }
    }

    /// Number of bytes covered, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_whole_file(&self) -> bool {
        self.start == 0 && self.end == OBJECT_EOF
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Extent) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == OBJECT_EOF {
            write!(f, "[{}, EOF]", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}
