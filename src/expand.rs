//! Extent expansion policy.
//!
//! A compatible request is widened to the largest range that contains it and
//! crosses no incompatible granted lock and no earlier incompatible waiter,
//! then trimmed to page boundaries.

use crate::config::ExpansionConfig;
use crate::flags::EnqueueFlags;
use crate::interval::IntervalTree;
use crate::lock::LockRecord;
use crate::mode::{compatible, LockMode};
use crate::resource::ResourceState;
use crate::types::{Extent, OBJECT_EOF};

/// Widening limits gathered from one queue.
#[derive(Debug, Clone, Copy)]
struct Limits {
    lo: u64,
    hi: u64,
    conflicts: usize,
}

impl Limits {
    fn open() -> Self {
        Self {
            lo: 0,
            hi: OBJECT_EOF,
            conflicts: 0,
        }
    }

    fn above(&mut self, start: u64) {
        self.hi = self.hi.min(start.saturating_sub(1));
    }
}

/// Compute the extent to grant to `req`, which must already be known to be
/// compatible with the resource.
pub(crate) fn expand_extent(
    state: &ResourceState,
    req: &LockRecord,
    cfg: &ExpansionConfig,
    server_page: u64,
) -> Extent {
    let want = req.req_extent;
    if want.is_whole_file() || req.enqueue_flags.contains(EnqueueFlags::LOCK_NO_EXPAND) {
        return want;
    }

    let mut limits = Limits::open();
    granted_limits(state, req, cfg, &mut limits);
    waiting_limits(state, req, cfg, &mut limits);

    let mask = alignment_mask(want, req.page_size.max(server_page));

    if req.enqueue_flags.contains(EnqueueFlags::ALIGN_NO_EXPAND) {
        // Round outward to pages, but never across a conflict.
        let start = limits.lo.max(want.start & !mask);
        let end = limits.hi.min(want.end | mask);
        return cover(Extent { start, end }, want);
    }

    let mut grown = Extent {
        start: limits.lo.min(want.start),
        end: limits.hi.max(want.end),
    };

    if limits.conflicts > cfg.grow_cap_threshold
        && matches!(req.req_mode, LockMode::Pw | LockMode::Cw)
    {
        let cap = want.start.saturating_add(cfg.grown_cap);
        if want.end < cap {
            grown.end = grown.end.min(cap);
        }
    }

    if grown.is_whole_file() {
        return grown;
    }

    // Shrink inward to aligned boundaries, keeping the unaligned limit when
    // the nearest boundary would uncover part of the request.
    if let Some(start) = align_start_up(grown.start, mask) {
        if start <= want.start {
            grown.start = start;
        }
    }
    if let Some(end) = align_end_down(grown.end, mask) {
        if end >= want.end {
            grown.end = end;
        }
    }
    grown
}

/// First boundary at or above `start`.
fn align_start_up(start: u64, mask: u64) -> Option<u64> {
    match start.checked_sub(1) {
        None => Some(0),
        Some(prev) => (prev | mask).checked_add(1),
    }
}

/// Last byte before the boundary at or below `end + 1`.
fn align_end_down(end: u64, mask: u64) -> Option<u64> {
    if end == OBJECT_EOF {
        return Some(end);
    }
    ((end + 1) & !mask).checked_sub(1)
}

/// Bound growth by the nearest incompatible granted neighbours.
fn granted_limits(
    state: &ResourceState,
    req: &LockRecord,
    cfg: &ExpansionConfig,
    limits: &mut Limits,
) {
    let want = req.req_extent;
    let mut conflicts = 0;
    let mut lo = 0;

    for mode in LockMode::ALL {
        let tree = state.tree(mode);
        if tree.is_empty() {
            continue;
        }
        if mode == LockMode::Group && req.req_mode == LockMode::Group {
            conflicts += foreign_group_limits(state, tree, req, limits, &mut lo);
            continue;
        }
        if req.req_mode.compat(mode) {
            continue;
        }
        conflicts += tree.len();
        if let Some(start) = tree.min_start_above(want.end) {
            limits.above(start);
        }
        if let Some(end) = tree.max_end_below(want.start) {
            lo = lo.max(end.saturating_add(1));
        }
    }

    limits.conflicts += conflicts;
    if conflicts > cfg.max_downward_conflicts {
        limits.lo = limits.lo.max(want.start);
    } else {
        limits.lo = limits.lo.max(lo);
    }
}

/// GROUP locks of another gid bound a GROUP request like any other conflict.
fn foreign_group_limits(
    state: &ResourceState,
    tree: &IntervalTree,
    req: &LockRecord,
    limits: &mut Limits,
    lo: &mut u64,
) -> usize {
    let want = req.req_extent;
    let mut conflicts = 0;
    for (extent, ids) in tree.iter() {
        let foreign = ids.iter().any(|id| {
            state
                .locks
                .get(id)
                .is_some_and(|l| !compatible(req.req_mode, req.gid, l.mode(), l.gid))
        });
        if !foreign {
            continue;
        }
        conflicts += 1;
        if extent.start > want.end {
            limits.above(extent.start);
        } else if extent.end < want.start {
            *lo = (*lo).max(extent.end.saturating_add(1));
        }
    }
    conflicts
}

/// Bound growth by earlier waiters that conflict with the request.
fn waiting_limits(
    state: &ResourceState,
    req: &LockRecord,
    cfg: &ExpansionConfig,
    limits: &mut Limits,
) {
    let want = req.req_extent;
    let mut conflicts = 0;
    let mut lo = 0;

    for &id in &state.waiting {
        if id == req.id {
            break;
        }
        let Some(waiter) = state.locks.get(&id) else {
            continue;
        };
        if compatible(req.req_mode, req.gid, waiter.req_mode, waiter.gid) {
            continue;
        }
        let theirs = waiter.req_extent;
        if theirs.end < want.start {
            lo = lo.max(theirs.end.saturating_add(1));
        } else if theirs.start > want.end {
            limits.above(theirs.start);
        } else {
            // Overlapping waiters are already queued behind the holders.
            continue;
        }
        conflicts += 1;
    }

    limits.conflicts += conflicts;
    if conflicts > cfg.max_downward_conflicts {
        limits.lo = limits.lo.max(want.start);
    } else {
        limits.lo = limits.lo.max(lo);
    }
}

/// Page mask for `want`: the larger of the page size and the request's own
/// natural alignment, minus one.
fn alignment_mask(want: Extent, page_size: u64) -> u64 {
    let mut mask = page_size.max(1);
    let align = want.end.wrapping_add(1) | want.start;
    if align != 0 && align & (mask - 1) == 0 {
        while align & mask == 0 {
            mask <<= 1;
        }
    }
    mask - 1
}

/// Never hand out less than was asked for.
fn cover(ext: Extent, want: Extent) -> Extent {
    Extent {
        start: ext.start.min(want.start),
        end: ext.end.max(want.end),
    }
}
