//! Compatibility checks of a request against the granted trees and the
//! waiting list of a resource.
//!
//! Both passes are read-only: they report what they found and leave every
//! state change (marking AST_SENT, queueing, granting) to the caller. That
//! keeps a failed NONBLOCK or PEEK request from touching the resource.

use crate::flags::LockFlags;
use crate::lock::LockRecord;
use crate::mode::{compatible, LockMode};
use crate::resource::ResourceState;
use crate::types::LockId;

/// What a compatibility pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompatOutcome {
    /// Nothing in the way.
    Compatible,
    /// Conflicting locks were collected into the work list.
    Conflict,
    /// A NONBLOCK or SPECULATIVE request met a conflict.
    NonblockFail,
    /// A granted GROUP lock with the same gid exists; grant right away.
    GroupGrant,
    /// A waiting GROUP lock with the same gid exists; queue right behind it.
    GroupClustered(LockId),
}

/// Result of one pass over a queue.
#[derive(Debug, Clone)]
pub(crate) struct CompatPass {
    pub outcome: CompatOutcome,
    /// Conflicting locks that count toward contention.
    pub contended: usize,
    /// Conflicting locks, in discovery order.
    pub work: Vec<LockId>,
}

impl CompatPass {
    fn new() -> Self {
        Self {
            outcome: CompatOutcome::Compatible,
            contended: 0,
            work: Vec::new(),
        }
    }

    fn nonblock_fail() -> Self {
        Self {
            outcome: CompatOutcome::NonblockFail,
            contended: 0,
            work: Vec::new(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.outcome,
            CompatOutcome::Conflict | CompatOutcome::NonblockFail
        )
    }

    fn conflict(&mut self, id: LockId, counted: bool) {
        self.outcome = CompatOutcome::Conflict;
        self.work.push(id);
        if counted {
            self.contended += 1;
        }
    }
}

/// Check `req` against every granted tree of the resource.
pub(crate) fn check_granted(state: &ResourceState, req: &LockRecord) -> CompatPass {
    let mut pass = CompatPass::new();
    let mut group_grant = false;
    let ext = req.req_extent;
    let no_wait = req.enqueue_flags.no_wait();

    for mode in LockMode::ALL {
        let tree = state.tree(mode);
        if tree.is_empty() {
            continue;
        }
        let gid_sensitive = mode == LockMode::Group && req.req_mode == LockMode::Group;
        if !gid_sensitive && req.req_mode.compat(mode) {
            continue;
        }

        for (_, id) in tree.iter_overlap(ext.start, ext.end) {
            if id == req.id {
                continue;
            }
            let Some(lock) = state.locks.get(&id) else {
                continue;
            };
            if compatible(req.req_mode, req.gid, lock.mode(), lock.gid) {
                // Only GROUP vs GROUP with the same gid gets here.
                group_grant = true;
                continue;
            }
            if no_wait {
                return CompatPass::nonblock_fail();
            }
            pass.conflict(id, !lock.is_glimpse_shaped());
        }
    }

    if pass.outcome == CompatOutcome::Compatible && group_grant {
        pass.outcome = CompatOutcome::GroupGrant;
    }
    pass
}

/// Check `req` against the waiting list, in arrival order, stopping at `req`
/// itself.
pub(crate) fn check_waiting(state: &ResourceState, req: &LockRecord) -> CompatPass {
    let mut pass = CompatPass::new();
    let ext = req.req_extent;
    let no_wait = req.enqueue_flags.no_wait();

    for &id in &state.waiting {
        if id == req.id {
            break;
        }
        let Some(waiter) = state.locks.get(&id) else {
            continue;
        };

        if req.req_mode == LockMode::Group
            && waiter.req_mode == LockMode::Group
            && waiter.gid == req.gid
        {
            pass.outcome = CompatOutcome::GroupClustered(id);
            return pass;
        }

        if compatible(req.req_mode, req.gid, waiter.req_mode, waiter.gid) {
            if waiter.req_extent.contains(&ext) && !waiter.flags.contains(LockFlags::AST_SENT) {
                // The waiter will shield us from everything behind it.
                return pass;
            }
            continue;
        }

        if !waiter.req_extent.overlaps(&ext) {
            continue;
        }
        if no_wait {
            return CompatPass::nonblock_fail();
        }
        pass.conflict(id, !waiter.is_glimpse_shaped());
    }
    pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::LocalAst;
    use crate::config::DelmConfig;
    use crate::flags::EnqueueFlags;
    use crate::lock::{EnqueueRequest, LockState};
    use crate::types::{ExportId, Extent, ResourceId};
    use std::sync::Arc;

    fn record(id: u64, mode: LockMode, start: u64, end: u64) -> LockRecord {
        let req = EnqueueRequest::new(
            ExportId(id),
            mode,
            Extent::new(start, end).unwrap(),
            Arc::new(LocalAst),
        );
        LockRecord::new(LockId(id), &req, 4096)
    }

    fn state() -> ResourceState {
        ResourceState::for_tests(ResourceId::new(1, 1), &DelmConfig::default())
    }

    fn grant(state: &mut ResourceState, mut rec: LockRecord) {
        rec.granted_mode = Some(rec.req_mode);
        rec.state = LockState::Granted;
        state.tree_mut(rec.req_mode).insert_unique(rec.extent, rec.id);
        state.locks.insert(rec.id, rec);
    }

    fn queue(state: &mut ResourceState, mut rec: LockRecord) {
        rec.state = LockState::Waiting;
        state.waiting.push(rec.id);
        state.locks.insert(rec.id, rec);
    }

    #[test]
    fn test_compatible_modes_pass() {
        let mut s = state();
        grant(&mut s, record(1, LockMode::Pr, 0, 4095));
        let pass = check_granted(&s, &record(2, LockMode::Pr, 0, 100));
        assert_eq!(pass.outcome, CompatOutcome::Compatible);
        assert!(pass.work.is_empty());
    }

    #[test]
    fn test_conflict_collects_work() {
        let mut s = state();
        grant(&mut s, record(1, LockMode::Pw, 0, 4095));
        grant(&mut s, record(2, LockMode::Pw, 8192, 12287));
        let pass = check_granted(&s, &record(3, LockMode::Pr, 0, 10000));
        assert_eq!(pass.outcome, CompatOutcome::Conflict);
        assert_eq!(pass.work, vec![LockId(1), LockId(2)]);
        assert_eq!(pass.contended, 2);
    }

    #[test]
    fn test_nonblock_fails_fast() {
        let mut s = state();
        grant(&mut s, record(1, LockMode::Ex, 0, 100));
        let mut req = record(2, LockMode::Pr, 50, 60);
        req.enqueue_flags = EnqueueFlags::NONBLOCK;
        let pass = check_granted(&s, &req);
        assert_eq!(pass.outcome, CompatOutcome::NonblockFail);
    }

    #[test]
    fn test_glimpse_lock_not_counted() {
        let mut s = state();
        grant(&mut s, record(1, LockMode::Pr, 0, crate::types::OBJECT_EOF));
        let pass = check_granted(&s, &record(2, LockMode::Pw, 100, 200));
        assert_eq!(pass.outcome, CompatOutcome::Conflict);
        assert_eq!(pass.work, vec![LockId(1)]);
        assert_eq!(pass.contended, 0);
    }

    #[test]
    fn test_group_grant_and_conflict() {
        let mut s = state();
        let mut g = record(1, LockMode::Group, 0, 4095);
        g.gid = Some(7);
        grant(&mut s, g);

        let mut same = record(2, LockMode::Group, 0, 4095);
        same.gid = Some(7);
        assert_eq!(check_granted(&s, &same).outcome, CompatOutcome::GroupGrant);

        let mut other = record(3, LockMode::Group, 0, 4095);
        other.gid = Some(8);
        assert_eq!(check_granted(&s, &other).outcome, CompatOutcome::Conflict);
    }

    #[test]
    fn test_waiting_clusters_group() {
        let mut s = state();
        let mut w = record(1, LockMode::Group, 0, 4095);
        w.gid = Some(7);
        queue(&mut s, w);
        queue(&mut s, record(2, LockMode::Pr, 0, 4095));

        let mut req = record(3, LockMode::Group, 0, 4095);
        req.gid = Some(7);
        assert_eq!(
            check_waiting(&s, &req).outcome,
            CompatOutcome::GroupClustered(LockId(1))
        );
    }

    #[test]
    fn test_waiting_covering_waiter_lets_pass() {
        let mut s = state();
        queue(&mut s, record(1, LockMode::Pr, 0, 10000));
        queue(&mut s, record(2, LockMode::Pw, 0, 100));

        let pass = check_waiting(&s, &record(3, LockMode::Pr, 10, 20));
        assert_eq!(pass.outcome, CompatOutcome::Compatible);

        s.locks.get_mut(&LockId(1)).unwrap().flags |= LockFlags::AST_SENT;
        let pass = check_waiting(&s, &record(3, LockMode::Pr, 10, 20));
        assert_eq!(pass.outcome, CompatOutcome::Conflict);
        assert_eq!(pass.work, vec![LockId(2)]);
    }

    #[test]
    fn test_waiting_stops_at_self() {
        let mut s = state();
        queue(&mut s, record(1, LockMode::Pr, 0, 100));
        queue(&mut s, record(2, LockMode::Pw, 0, 100));
        let me = s.locks.get(&LockId(1)).unwrap();
        assert_eq!(check_waiting(&s, me).outcome, CompatOutcome::Compatible);
    }
}
