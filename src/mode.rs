//! Lock modes and the mode compatibility matrix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Null lock: no access, used to keep a reference on a resource.
    Nl,
    /// Concurrent read.
    Cr,
    /// Concurrent write.
    Cw,
    /// Protected read.
    Pr,
    /// Protected write.
    Pw,
    /// Exclusive.
    Ex,
    /// Group lock, shared only by holders of the same group id.
    Group,
}

/// Number of lock modes, and so of interval trees per resource.
pub const MODE_COUNT: usize = 7;

impl LockMode {
    pub const ALL: [LockMode; MODE_COUNT] = [
        LockMode::Nl,
        LockMode::Cr,
        LockMode::Cw,
        LockMode::Pr,
        LockMode::Pw,
        LockMode::Ex,
        LockMode::Group,
    ];

    /// Index of the per-mode interval tree.
    pub fn index(self) -> usize {
        match self {
            LockMode::Nl => 0,
            LockMode::Cr => 1,
            LockMode::Cw => 2,
            LockMode::Pr => 3,
            LockMode::Pw => 4,
            LockMode::Ex => 5,
            LockMode::Group => 6,
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Modes compatible with `self`, as a bitmask indexed by [`LockMode::index`].
    /// GROUP lists itself; the gid comparison is done by [`compatible`].
    fn compat_mask(self) -> u8 {
        use LockMode::*;
        match self {
            Nl => Nl.bit() | Cr.bit() | Cw.bit() | Pr.bit() | Pw.bit() | Ex.bit() | Group.bit(),
            Cr => Nl.bit() | Cr.bit() | Cw.bit() | Pr.bit() | Pw.bit(),
            Cw => Nl.bit() | Cr.bit() | Cw.bit(),
            Pr => Nl.bit() | Cr.bit() | Pr.bit(),
            Pw => Nl.bit() | Cr.bit(),
            Ex => Nl.bit(),
            Group => Nl.bit() | Group.bit(),
        }
    }

    /// Mode-only compatibility (GROUP vs GROUP reports `true`).
    pub fn compat(self, other: LockMode) -> bool {
        self.compat_mask() & other.bit() != 0
    }

    /// Whether a lock in this mode lets its holder write.
    pub fn is_write(self) -> bool {
        matches!(self, LockMode::Cw | LockMode::Pw | LockMode::Ex | LockMode::Group)
    }

    fn rank(self) -> u8 {
        match self {
            LockMode::Nl => 0,
            LockMode::Cr => 1,
            LockMode::Cw | LockMode::Pr => 2,
            LockMode::Pw => 3,
            LockMode::Ex => 4,
            LockMode::Group => 3,
        }
    }

    /// Whether a lock held in `self` protects an access that needs `wanted`.
    ///
    /// `NL ≤ CR ≤ {CW, PR} ≤ PW ≤ EX`; CW and PR are unordered. GROUP covers
    /// everything below EX; the caller must still compare gids.
    pub fn satisfies(self, wanted: LockMode) -> bool {
        if self == wanted {
            return true;
        }
        match (self, wanted) {
            (LockMode::Cw, LockMode::Pr) | (LockMode::Pr, LockMode::Cw) => false,
            (_, LockMode::Group) => false,
            (LockMode::Group, LockMode::Ex) => false,
            _ => self.rank() >= wanted.rank(),
        }
    }
}

/// Full compatibility test including group ids.
pub fn compatible(a: LockMode, a_gid: Option<u64>, b: LockMode, b_gid: Option<u64>) -> bool {
    if a == LockMode::Group && b == LockMode::Group {
        return a_gid == b_gid;
    }
    a.compat(b)
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::Nl => "NL",
            LockMode::Cr => "CR",
            LockMode::Cw => "CW",
            LockMode::Pr => "PR",
            LockMode::Pw => "PW",
            LockMode::Ex => "EX",
            LockMode::Group => "GROUP",
        };
        f.write_str(s)
    }
}
