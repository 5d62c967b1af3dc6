//! Lockable resources and their per-resource lock state.
//!
//! Every structure of a resource (the per-mode granted trees, the waiting
//! list, the zombie list and the lock records themselves) sits behind one
//! `parking_lot::Mutex`. Methods on [`ResourceState`] run with that mutex
//! held and never block: callbacks toward holders are collected into a
//! [`Delta`] and sent by the namespace once the guard is gone.

use crate::ast::{AstHandler, AstWork, BlockingAst, CompletionAst};
use crate::compat::{check_granted, check_waiting, CompatOutcome, CompatPass};
use crate::config::{ContentionConfig, DelmConfig, ExpansionConfig};
use crate::error::{DelmError, Result};
use crate::expand::expand_extent;
use crate::flags::{EnqueueFlags, LockFlags, ReplyFlags};
use crate::interval::IntervalTree;
use crate::kms;
use crate::lock::{
    ConflictReport, EnqueueRequest, GrantNotice, LockInfo, LockRecord, LockState,
};
use crate::mode::{compatible, LockMode, MODE_COUNT};
use crate::types::{ExportId, Extent, Gid, LockId, ResourceId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Tunables every resource of a namespace shares.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    pub contention: ContentionConfig,
    pub expansion: ExpansionConfig,
    pub page_size: u64,
    pub callback_timeout: Duration,
    pub max_locks: usize,
}

impl ResourcePolicy {
    pub fn from_config(config: &DelmConfig) -> Self {
        Self {
            contention: config.contention.clone(),
            expansion: config.expansion.clone(),
            page_size: config.namespace.page_size,
            callback_timeout: config.namespace.callback_timeout,
            max_locks: config.namespace.max_locks,
        }
    }
}

/// A lockable object.
pub struct Resource {
    id: ResourceId,
    refcount: AtomicUsize,
    pub(crate) state: Mutex<ResourceState>,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, policy: Arc<ResourcePolicy>, live: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            refcount: AtomicUsize::new(0),
            state: Mutex::new(ResourceState::new(id, policy, live)),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Outstanding `resource_get` references.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning the remaining count.
    pub(crate) fn put_ref(&self) -> usize {
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Current known minimum size.
    pub fn kms(&self) -> u64 {
        self.state.lock().kms
    }

    pub fn lock_info(&self, id: LockId) -> Option<LockInfo> {
        let state = self.state.lock();
        state.locks.get(&id).map(|l| l.info(self.id))
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.state.lock().snapshot()
    }

    /// Verify every structural invariant of the resource.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.state.lock().check_invariants()
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Point-in-time view of a resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub kms: u64,
    /// Granted locks, grouped by mode, each group in extent order.
    pub granted: Vec<LockInfo>,
    /// Waiting locks in queue order.
    pub waiting: Vec<LockInfo>,
    pub zombies: Vec<LockInfo>,
}

/// Why a lock is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Client,
    Forced,
    Shutdown,
}

/// State changes produced under the resource lock.
#[derive(Default)]
pub(crate) struct Delta {
    pub work: Vec<AstWork>,
    pub granted: Vec<LockInfo>,
    pub queued: Vec<LockInfo>,
    pub cancelled: Vec<LockInfo>,
    pub contended: usize,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.work.is_empty()
            && self.granted.is_empty()
            && self.queued.is_empty()
            && self.cancelled.is_empty()
    }
}

/// Immediate answer to an enqueue.
pub(crate) enum Reply {
    Granted { info: LockInfo, flags: ReplyFlags },
    Waiting {
        info: LockInfo,
        flags: ReplyFlags,
        rx: oneshot::Receiver<Result<GrantNotice>>,
    },
    Conflict(ConflictReport),
    Available,
}

pub(crate) struct ResourceState {
    pub id: ResourceId,
    trees: [IntervalTree; MODE_COUNT],
    /// Arrival order, except for GROUP clustering.
    pub waiting: Vec<LockId>,
    pub zombies: Vec<LockId>,
    pub locks: HashMap<LockId, LockRecord>,
    pub kms: u64,
    pub last_contention: Option<Instant>,
    /// Set once the registry has dropped the resource.
    pub released: bool,
    policy: Arc<ResourcePolicy>,
    live: Arc<AtomicUsize>,
}

impl ResourceState {
    fn new(id: ResourceId, policy: Arc<ResourcePolicy>, live: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            trees: Default::default(),
            waiting: Vec::new(),
            zombies: Vec::new(),
            locks: HashMap::new(),
            kms: 0,
            last_contention: None,
            released: false,
            policy,
            live,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: ResourceId, config: &DelmConfig) -> Self {
        Self::new(
            id,
            Arc::new(ResourcePolicy::from_config(config)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    pub fn tree(&self, mode: LockMode) -> &IntervalTree {
        &self.trees[mode.index()]
    }

    #[cfg(test)]
    pub fn tree_mut(&mut self, mode: LockMode) -> &mut IntervalTree {
        &mut self.trees[mode.index()]
    }

    /// No lock record of any kind remains.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn reserve(&self) -> Result<()> {
        let prev = self.live.fetch_add(1, Ordering::AcqRel);
        if prev >= self.policy.max_locks {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(DelmError::OutOfMemory(format!(
                "lock table full ({} locks)",
                self.policy.max_locks
            )));
        }
        Ok(())
    }

    fn free(&mut self, id: LockId) {
        if self.locks.remove(&id).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Record contention and report whether the resource is contended now.
    fn note_contention(&mut self, contended: usize, now: Instant) -> bool {
        let policy = &self.policy.contention;
        if contended > policy.max_contended {
            self.last_contention = Some(now);
        }
        self.last_contention
            .is_some_and(|t| now.saturating_duration_since(t) <= policy.contention_window)
    }

    fn infos(&self, ids: &[LockId]) -> Vec<LockInfo> {
        ids.iter()
            .filter_map(|id| self.locks.get(id))
            .map(|l| l.info(self.id))
            .collect()
    }

    /// Process a new request.
    pub fn enqueue(
        &mut self,
        id: LockId,
        request: &EnqueueRequest,
        now: Instant,
        delta: &mut Delta,
    ) -> Result<Reply> {
        if self.released {
            return Err(DelmError::InvalidArgument(format!(
                "resource {} has been released",
                self.id
            )));
        }
        let flags = request.flags;

        if flags.contains(EnqueueFlags::LOCK_MATCH) {
            let found = self
                .match_granted(request.mode, request.extent, request.gid, true)
                .ok_or(DelmError::WouldBlock)?;
            let info = self.locks[&found].info(self.id);
            return Ok(Reply::Granted {
                info,
                flags: ReplyFlags::MATCHED,
            });
        }

        let rec = LockRecord::new(id, request, self.policy.page_size);

        let granted = check_granted(self, &rec);
        if granted.outcome == CompatOutcome::NonblockFail {
            return Err(DelmError::WouldBlock);
        }
        let scan_waiting = match granted.outcome {
            CompatOutcome::Compatible => true,
            CompatOutcome::Conflict => rec.req_mode == LockMode::Group,
            _ => false,
        };
        let waiting = if scan_waiting {
            let pass = check_waiting(self, &rec);
            if pass.outcome == CompatOutcome::NonblockFail {
                return Err(DelmError::WouldBlock);
            }
            pass
        } else {
            CompatPass {
                outcome: CompatOutcome::Compatible,
                contended: 0,
                work: Vec::new(),
            }
        };

        let clustered_after = match waiting.outcome {
            CompatOutcome::GroupClustered(after) => Some(after),
            _ => None,
        };
        let conflict = granted.is_conflict() || waiting.is_conflict() || clustered_after.is_some();
        let contended = granted.contended + waiting.contended;
        delta.contended += contended;
        let is_contended = self.note_contention(contended, now);

        if conflict
            && is_contended
            && flags.contains(EnqueueFlags::DENY_ON_CONTENTION)
            && !flags.contains(EnqueueFlags::MUST)
            && rec.req_mode != LockMode::Group
            && rec.req_extent.end - rec.req_extent.start <= self.policy.contention.max_nolock_size
        {
            debug!(resource = %self.id, lock = %id, contended, "Denied on contention");
            return Err(DelmError::Contended);
        }

        if flags.contains(EnqueueFlags::PEEK) {
            if !conflict {
                return Ok(Reply::Available);
            }
            let mut holders = self.infos(&granted.work);
            holders.extend(self.infos(&waiting.work));
            return Ok(Reply::Conflict(ConflictReport {
                holders,
                kms: self.kms,
            }));
        }

        if flags.contains(EnqueueFlags::GLIMPSE) && granted.is_conflict() {
            return Ok(Reply::Conflict(ConflictReport {
                holders: self.infos(&granted.work),
                kms: self.kms,
            }));
        }

        self.reserve()?;

        if !conflict {
            let extent = expand_extent(self, &rec, &self.policy.expansion, self.policy.page_size);
            let (info, reply_flags, pending) = self.grant_record(rec, extent, now);
            delta.granted.push(info.clone());
            if let Some(work) = pending {
                delta.work.push(work);
            }
            return Ok(Reply::Granted {
                info,
                flags: reply_flags,
            });
        }

        let mut rec = rec;
        rec.state = LockState::Waiting;
        let (tx, rx) = oneshot::channel();
        rec.notify = Some(tx);
        let blocker = rec.info(self.id);
        let discard = flags.contains(EnqueueFlags::DISCARD_DATA);

        let pos = match clustered_after {
            Some(after) => self.cluster_position(after, rec.gid),
            None => self.waiting.len(),
        };
        self.waiting.insert(pos, id);
        self.locks.insert(id, rec);

        self.send_blocking(&granted.work, &blocker, discard, now, delta);
        self.send_blocking(&waiting.work, &blocker, discard, now, delta);

        trace!(resource = %self.id, lock = %id, position = pos, "Queued");
        delta.queued.push(blocker.clone());
        Ok(Reply::Waiting {
            info: blocker,
            flags: ReplyFlags::NO_TIMEOUT,
            rx,
        })
    }

    /// Position right after the run of same-gid GROUP waiters starting at
    /// `after`.
    fn cluster_position(&self, after: LockId, gid: Option<Gid>) -> usize {
        let Some(mut pos) = self.waiting.iter().position(|w| *w == after) else {
            return self.waiting.len();
        };
        pos += 1;
        while pos < self.waiting.len() {
            let same = self.locks.get(&self.waiting[pos]).is_some_and(|l| {
                l.req_mode == LockMode::Group && l.gid == gid
            });
            if !same {
                break;
            }
            pos += 1;
        }
        pos
    }

    /// Insert `rec` into its granted tree with `extent`. Returns the lock
    /// info, the reply flags and the blocking AST owed if the lock was
    /// already asked to give way while it waited.
    fn grant_record(
        &mut self,
        mut rec: LockRecord,
        extent: Extent,
        now: Instant,
    ) -> (LockInfo, ReplyFlags, Option<AstWork>) {
        let mode = rec.req_mode;
        rec.extent = extent;
        rec.granted_mode = Some(mode);
        rec.state = LockState::Granted;

        let mut flags = ReplyFlags::empty();
        if extent != rec.req_extent {
            flags |= ReplyFlags::LOCK_CHANGED;
        }

        let mut pending = None;
        if rec.flags.contains(LockFlags::AST_SENT) {
            flags |= ReplyFlags::BLOCK_PENDING;
            rec.state = LockState::Canceling;
            rec.callback_deadline = Some(now + self.policy.callback_timeout);
            pending = Some(AstWork::Blocking {
                handler: Arc::clone(&rec.ast),
                ast: BlockingAst {
                    lock: rec.info(self.id),
                    blocker: None,
                    discard_data: false,
                },
            });
        }

        self.trees[mode.index()].insert_unique(extent, rec.id);
        let info = rec.info(self.id);
        trace!(resource = %self.id, lock = %rec.id, %mode, %extent, "Granted");
        self.locks.insert(rec.id, rec);
        (info, flags, pending)
    }

    /// Ask conflicting holders to give way. Waiting locks are only marked;
    /// their blocking AST goes out when they are granted.
    fn send_blocking(
        &mut self,
        ids: &[LockId],
        blocker: &LockInfo,
        discard: bool,
        now: Instant,
        delta: &mut Delta,
    ) {
        let resource = self.id;
        let deadline = now + self.policy.callback_timeout;
        for id in ids {
            let Some(lock) = self.locks.get_mut(id) else {
                continue;
            };
            if lock.flags.contains(LockFlags::AST_SENT) {
                continue;
            }
            lock.flags |= LockFlags::AST_SENT;
            if lock.state == LockState::Waiting {
                continue;
            }
            lock.state = LockState::Canceling;
            lock.callback_deadline = Some(deadline);
            delta.work.push(AstWork::Blocking {
                handler: Arc::clone(&lock.ast),
                ast: BlockingAst {
                    lock: lock.info(resource),
                    blocker: Some(blocker.clone()),
                    discard_data: discard,
                },
            });
        }
    }

    /// Retry every waiter against the granted set, in order.
    pub fn reprocess(&mut self, now: Instant, delta: &mut Delta) {
        let mut i = 0;
        while i < self.waiting.len() {
            let id = self.waiting[i];
            let Some(rec) = self.locks.get(&id) else {
                self.waiting.remove(i);
                continue;
            };
            let pass = check_granted(self, rec);
            match pass.outcome {
                CompatOutcome::Compatible | CompatOutcome::GroupGrant => {
                    let extent =
                        expand_extent(self, rec, &self.policy.expansion, self.policy.page_size);
                    self.waiting.remove(i);
                    let Some(mut rec) = self.locks.remove(&id) else {
                        continue;
                    };
                    let notify = rec.notify.take();
                    let handler = Arc::clone(&rec.ast);
                    let (info, flags, pending) = self.grant_record(rec, extent, now);
                    if let Some(tx) = notify {
                        let _ = tx.send(Ok(GrantNotice {
                            extent,
                            mode: info.req_mode,
                            flags,
                        }));
                    }
                    delta.work.push(AstWork::Completion {
                        handler,
                        ast: CompletionAst {
                            lock: info.clone(),
                            flags,
                        },
                    });
                    if let Some(work) = pending {
                        delta.work.push(work);
                    }
                    delta.granted.push(info);
                }
                _ => {
                    let blocker = rec.info(self.id);
                    let discard = rec.enqueue_flags.contains(EnqueueFlags::DISCARD_DATA);
                    self.send_blocking(&pass.work, &blocker, discard, now, delta);
                    i += 1;
                }
            }
        }
    }

    /// Detach and destroy a lock without reprocessing the queue. Returns
    /// `false` if the lock is unknown or already destroyed.
    pub fn destroy(&mut self, id: LockId, reason: CancelReason, delta: &mut Delta) -> bool {
        let Some(lock) = self.locks.get_mut(&id) else {
            return false;
        };
        if lock.is_destroyed() {
            return false;
        }
        let prior = lock.state;
        let extent = lock.extent;
        let mode = lock.mode();

        match prior {
            LockState::Waiting => {
                if let Some(tx) = lock.notify.take() {
                    let err = match reason {
                        CancelReason::Shutdown => DelmError::Shutdown,
                        _ => DelmError::Interrupted,
                    };
                    let _ = tx.send(Err(err));
                }
                self.waiting.retain(|w| *w != id);
            }
            LockState::Granted | LockState::Canceling => {
                self.trees[mode.index()].remove(&extent, id);
                let old = self.kms;
                self.kms = kms::shift_kms(self, id, old);
            }
            LockState::New | LockState::Destroyed => {}
        }

        let resource = self.id;
        let Some(lock) = self.locks.get_mut(&id) else {
            return false;
        };
        lock.flags |= LockFlags::DESTROYED;
        if reason != CancelReason::Client {
            lock.flags |= LockFlags::FORCED;
        }
        lock.state = LockState::Destroyed;
        lock.callback_deadline = None;
        delta.cancelled.push(lock.info(resource));

        if lock.refs > 0 {
            self.zombies.push(id);
        } else {
            self.free(id);
        }
        true
    }

    /// `destroy` followed by a reprocess of the waiting list.
    pub fn cancel(&mut self, id: LockId, reason: CancelReason, now: Instant, delta: &mut Delta) {
        if self.destroy(id, reason, delta) {
            self.reprocess(now, delta);
        }
    }

    /// Drop one local reference.
    pub fn release(&mut self, id: LockId, now: Instant, delta: &mut Delta) -> Result<()> {
        let lock = self
            .locks
            .get_mut(&id)
            .ok_or(DelmError::StaleLock(id.0))?;
        if lock.refs == 0 {
            return Err(DelmError::InvalidArgument(format!(
                "lock {} holds no references",
                id
            )));
        }
        lock.refs -= 1;
        if lock.refs > 0 {
            return Ok(());
        }
        if lock.is_destroyed() {
            self.zombies.retain(|z| *z != id);
            self.free(id);
        } else if lock.flags.contains(LockFlags::CANCEL_ON_RELEASE) {
            self.cancel(id, CancelReason::Client, now, delta);
        }
        Ok(())
    }

    /// The holder acknowledged its blocking AST.
    pub fn ast_completed(&mut self, id: LockId, now: Instant, delta: &mut Delta) -> Result<()> {
        let lock = self
            .locks
            .get_mut(&id)
            .ok_or(DelmError::StaleLock(id.0))?;
        if lock.is_destroyed() {
            return Ok(());
        }
        lock.flags |= LockFlags::CANCEL_ON_RELEASE;
        if lock.refs == 0 {
            self.cancel(id, CancelReason::Client, now, delta);
        }
        Ok(())
    }

    /// Find a granted lock covering `extent` in a mode that satisfies `mode`,
    /// taking a reference on it if `take_ref`.
    pub fn match_granted(
        &mut self,
        mode: LockMode,
        extent: Extent,
        gid: Option<Gid>,
        take_ref: bool,
    ) -> Option<LockId> {
        let mut found = None;
        'trees: for held in LockMode::ALL {
            if !held.satisfies(mode) {
                continue;
            }
            for (granted, id) in self.tree(held).iter_overlap(extent.start, extent.end) {
                if !granted.contains(&extent) {
                    continue;
                }
                let Some(lock) = self.locks.get(&id) else {
                    continue;
                };
                if lock.is_destroyed()
                    || lock
                        .flags
                        .intersects(LockFlags::AST_SENT | LockFlags::CANCEL_ON_RELEASE)
                {
                    continue;
                }
                if held == LockMode::Group && lock.gid != gid {
                    continue;
                }
                found = Some(id);
                break 'trees;
            }
        }
        let id = found?;
        if take_ref {
            if let Some(lock) = self.locks.get_mut(&id) {
                lock.refs += 1;
            }
        }
        Some(id)
    }

    /// Re-install a lock that was granted before recovery.
    pub fn replay(&mut self, id: LockId, request: &EnqueueRequest, now: Instant) -> Result<LockInfo> {
        let rec = LockRecord::new(id, request, self.policy.page_size);
        let pass = check_granted(self, &rec);
        if !matches!(
            pass.outcome,
            CompatOutcome::Compatible | CompatOutcome::GroupGrant
        ) {
            return Err(DelmError::InvalidArgument(format!(
                "replayed lock {} conflicts with a granted lock",
                id
            )));
        }
        self.reserve()?;
        let (info, _, _) = self.grant_record(rec, request.extent, now);
        Ok(info)
    }

    pub fn prolong(
        &mut self,
        export: ExportId,
        range: Extent,
        mode: LockMode,
        deadline: Instant,
    ) -> usize {
        kms::prolong(self, export, range, mode, deadline)
    }

    /// Locks whose callback deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<LockId> {
        self.locks
            .values()
            .filter(|l| {
                !l.is_destroyed()
                    && !l.flags.contains(LockFlags::LOCAL)
                    && l.callback_deadline.is_some_and(|d| d <= now)
            })
            .map(|l| l.id)
            .collect()
    }

    /// Live locks held by `export`.
    pub fn export_locks(&self, export: ExportId) -> Vec<LockId> {
        let mut ids: Vec<LockId> = self
            .locks
            .values()
            .filter(|l| l.export == export && !l.is_destroyed())
            .map(|l| l.id)
            .collect();
        ids.sort();
        ids
    }

    /// The write-mode lock reaching furthest into the object.
    pub fn highest_writer(&self) -> Option<(Arc<dyn AstHandler>, LockInfo)> {
        let mut best: Option<&LockRecord> = None;
        for mode in [LockMode::Cw, LockMode::Pw, LockMode::Ex, LockMode::Group] {
            for (extent, ids) in self.tree(mode).iter() {
                for id in ids {
                    let Some(lock) = self.locks.get(id) else {
                        continue;
                    };
                    if lock.is_destroyed() {
                        continue;
                    }
                    if best.map_or(true, |b| extent.end > b.extent.end) {
                        best = Some(lock);
                    }
                }
            }
        }
        best.map(|l| (Arc::clone(&l.ast), l.info(self.id)))
    }

    /// Destroy every lock and drain zombies.
    pub fn shutdown(&mut self, delta: &mut Delta) {
        let waiting: Vec<LockId> = self.waiting.clone();
        for id in waiting {
            self.destroy(id, CancelReason::Shutdown, delta);
        }
        let mut rest: Vec<LockId> = self.locks.keys().copied().collect();
        rest.sort();
        for id in rest {
            self.destroy(id, CancelReason::Shutdown, delta);
        }
        for id in std::mem::take(&mut self.zombies) {
            self.free(id);
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let mut granted = Vec::new();
        for mode in LockMode::ALL {
            for (_, ids) in self.tree(mode).iter() {
                granted.extend(self.infos(ids));
            }
        }
        ResourceSnapshot {
            id: self.id,
            kms: self.kms,
            granted,
            waiting: self.infos(&self.waiting),
            zombies: self.infos(&self.zombies),
        }
    }

    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut seen: HashMap<LockId, &'static str> = HashMap::new();
        let mut place = |id: LockId, what: &'static str| -> std::result::Result<(), String> {
            match seen.insert(id, what) {
                Some(prev) => Err(format!("lock {} is both in {} and {}", id, prev, what)),
                None => Ok(()),
            }
        };

        let mut granted = Vec::new();
        for mode in LockMode::ALL {
            let tree = self.tree(mode);
            tree.check_invariants()
                .map_err(|e| format!("{} tree: {}", mode, e))?;
            for (extent, ids) in tree.iter() {
                for id in ids {
                    place(*id, "a granted tree")?;
                    let lock = self
                        .locks
                        .get(id)
                        .ok_or_else(|| format!("granted lock {} has no record", id))?;
                    if lock.granted_mode != Some(mode) {
                        return Err(format!("lock {} sits in the {} tree", id, mode));
                    }
                    if !lock.state.is_granted() || lock.extent != extent {
                        return Err(format!("lock {} is not granted at {}", id, extent));
                    }
                    granted.push(lock);
                }
            }
        }

        for id in &self.waiting {
            place(*id, "the waiting list")?;
            let lock = self
                .locks
                .get(id)
                .ok_or_else(|| format!("waiting lock {} has no record", id))?;
            if lock.state != LockState::Waiting {
                return Err(format!("lock {} queued in state {:?}", id, lock.state));
            }
        }

        for id in &self.zombies {
            place(*id, "the zombie list")?;
            let lock = self
                .locks
                .get(id)
                .ok_or_else(|| format!("zombie {} has no record", id))?;
            if !lock.is_destroyed() || lock.refs == 0 {
                return Err(format!("zombie {} is not a referenced destroyed lock", id));
            }
        }

        if seen.len() != self.locks.len() {
            return Err(format!(
                "{} lock records but {} placed",
                self.locks.len(),
                seen.len()
            ));
        }

        for (i, a) in granted.iter().enumerate() {
            for b in &granted[i + 1..] {
                if a.extent.overlaps(&b.extent)
                    && !compatible(a.mode(), a.gid, b.mode(), b.gid)
                {
                    return Err(format!(
                        "locks {} ({} {}) and {} ({} {}) overlap incompatibly",
                        a.id,
                        a.mode(),
                        a.extent,
                        b.id,
                        b.mode(),
                        b.extent
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::LocalAst;
    use crate::types::OBJECT_EOF;

    fn state() -> ResourceState {
        ResourceState::for_tests(ResourceId::new(0, 42), &DelmConfig::default())
    }

    fn request(export: u64, mode: LockMode, start: u64, end: u64) -> EnqueueRequest {
        EnqueueRequest::new(
            ExportId(export),
            mode,
            Extent::new(start, end).unwrap(),
            Arc::new(LocalAst),
        )
    }

    fn enqueue(s: &mut ResourceState, id: u64, req: EnqueueRequest) -> Result<Reply> {
        let mut delta = Delta::default();
        s.enqueue(LockId(id), &req, Instant::now(), &mut delta)
    }

    #[test]
    fn test_grant_then_wait_then_reprocess() {
        let mut s = state();
        let reply = enqueue(&mut s, 1, request(1, LockMode::Pw, 0, 4095)).unwrap();
        let Reply::Granted { info, flags } = reply else {
            panic!("expected grant");
        };
        assert_eq!(info.extent, Extent::WHOLE_FILE);
        assert!(flags.contains(ReplyFlags::LOCK_CHANGED));

        let mut delta = Delta::default();
        let reply = s
            .enqueue(LockId(2), &request(2, LockMode::Pr, 0, 4095), Instant::now(), &mut delta)
            .unwrap();
        assert!(matches!(reply, Reply::Waiting { .. }));
        assert_eq!(delta.work.len(), 1);
        assert!(s.locks[&LockId(1)].flags.contains(LockFlags::AST_SENT));
        s.check_invariants().unwrap();

        let mut delta = Delta::default();
        s.cancel(LockId(1), CancelReason::Client, Instant::now(), &mut delta);
        assert_eq!(delta.granted.len(), 1);
        assert_eq!(delta.granted[0].extent, Extent::WHOLE_FILE);
        assert!(s.waiting.is_empty());
        assert_eq!(s.kms, 0);
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_nonblock_leaves_no_trace() {
        let mut s = state();
        enqueue(&mut s, 1, request(1, LockMode::Ex, 0, OBJECT_EOF)).unwrap();
        let req = request(2, LockMode::Pr, 0, 10).with_flags(EnqueueFlags::NONBLOCK);
        assert!(matches!(enqueue(&mut s, 2, req), Err(DelmError::WouldBlock)));
        assert_eq!(s.locks.len(), 1);
        assert!(s.waiting.is_empty());
        assert!(!s.locks[&LockId(1)].flags.contains(LockFlags::AST_SENT));
    }

    #[test]
    fn test_zombie_until_released() {
        let mut s = state();
        enqueue(&mut s, 1, request(1, LockMode::Pr, 0, 4095)).unwrap();
        let probe = Extent::new(0, 10).unwrap();
        assert_eq!(s.match_granted(LockMode::Pr, probe, None, true), Some(LockId(1)));

        let mut delta = Delta::default();
        s.cancel(LockId(1), CancelReason::Client, Instant::now(), &mut delta);
        assert_eq!(s.zombies, vec![LockId(1)]);
        s.check_invariants().unwrap();

        s.release(LockId(1), Instant::now(), &mut delta).unwrap();
        assert!(s.zombies.is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn test_lock_limit() {
        let mut config = DelmConfig::default();
        config.namespace.max_locks = 1;
        let mut s = ResourceState::for_tests(ResourceId::new(0, 1), &config);
        enqueue(&mut s, 1, request(1, LockMode::Pr, 0, 4095)).unwrap();
        assert!(matches!(
            enqueue(&mut s, 2, request(2, LockMode::Pr, 0, 4095)),
            Err(DelmError::OutOfMemory(_))
        ));
        assert_eq!(s.locks.len(), 1);
    }

    #[test]
    fn test_replay_rejects_conflict() {
        let mut s = state();
        s.replay(LockId(1), &request(1, LockMode::Pw, 0, 4095), Instant::now())
            .unwrap();
        assert!(s
            .replay(LockId(2), &request(2, LockMode::Pw, 100, 200), Instant::now())
            .is_err());
        let info = s
            .replay(LockId(3), &request(3, LockMode::Pw, 4096, 8191), Instant::now())
            .unwrap();
        assert_eq!(info.extent, Extent::new(4096, 8191).unwrap());
        s.check_invariants().unwrap();
    }
}
