//! Known-minimum-size tracking and lock prolongation.

use crate::flags::LockFlags;
use crate::mode::LockMode;
use crate::resource::ResourceState;
use crate::types::{ExportId, Extent, LockId, OBJECT_EOF};
use std::time::Instant;

/// Recompute the size hint once `removed` no longer protects writes.
///
/// The lock is marked `KMS_IGNORE` first, so calling this twice returns the
/// same value. If any remaining lock reaches `old_kms`, the hint is unchanged.
pub(crate) fn shift_kms(state: &mut ResourceState, removed: LockId, old_kms: u64) -> u64 {
    if let Some(lock) = state.locks.get_mut(&removed) {
        lock.flags |= LockFlags::KMS_IGNORE;
    }

    let mut kms = 0;
    for mode in LockMode::ALL {
        for (extent, ids) in state.tree(mode).iter_rev() {
            let live = ids.iter().any(|id| {
                state.locks.get(id).is_some_and(|l| {
                    !l.flags.intersects(LockFlags::KMS_IGNORE | LockFlags::DESTROYED)
                })
            });
            if !live {
                continue;
            }
            if extent.end == OBJECT_EOF || extent.end + 1 >= old_kms {
                return old_kms;
            }
            kms = kms.max(extent.end + 1);
            // Locks in these trees never overlap, so the first one is highest.
            if matches!(mode, LockMode::Pw | LockMode::Ex) {
                break;
            }
        }
    }
    kms
}

/// Push back the callback deadline of every lock of `export` that has a
/// blocking AST pending and covers `[range]` in a mode satisfying `mode`.
pub(crate) fn prolong(
    state: &mut ResourceState,
    export: ExportId,
    range: Extent,
    mode: LockMode,
    deadline: Instant,
) -> usize {
    let mut hits = Vec::new();
    for held in LockMode::ALL {
        if !held.satisfies(mode) {
            continue;
        }
        for (_, id) in state.tree(held).iter_overlap(range.start, range.end) {
            let Some(lock) = state.locks.get(&id) else {
                continue;
            };
            if lock.export != export
                || lock.is_destroyed()
                || !lock.flags.contains(LockFlags::AST_SENT)
            {
                continue;
            }
            hits.push(id);
        }
    }

    for id in &hits {
        if let Some(lock) = state.locks.get_mut(id) {
            lock.callback_deadline = Some(match lock.callback_deadline {
                Some(current) => current.max(deadline),
                None => deadline,
            });
        }
    }
    hits.len()
}
