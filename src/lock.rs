//! Extent lock records, requests and enqueue outcomes.
//!
//! A lock lives in the arena of its [`Resource`] and is addressed by a
//! [`LockHandle`] (resource + [`LockId`]). Its lifecycle is
//! `New → Waiting → Granted → Canceling → Destroyed`; a destroyed lock that
//! still has local references stays on the resource's zombie list until the
//! last [`LockNamespace::release`](crate::LockNamespace::release).

use crate::ast::AstHandler;
use crate::error::{DelmError, Result};
use crate::flags::{EnqueueFlags, LockFlags, ReplyFlags};
use crate::mode::LockMode;
use crate::namespace::LockNamespace;
use crate::resource::Resource;
use crate::types::{ExportId, Extent, Gid, LockId, ResourceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Lifecycle state of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    New,
    Waiting,
    Granted,
    /// Granted, with a blocking AST sent to the holder.
    Canceling,
    Destroyed,
}

impl LockState {
    pub fn is_granted(self) -> bool {
        matches!(self, LockState::Granted | LockState::Canceling)
    }
}

/// Server-side lock record.
pub(crate) struct LockRecord {
    pub id: LockId,
    pub export: ExportId,
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub gid: Option<Gid>,
    pub req_extent: Extent,
    /// Granted extent; equal to `req_extent` until the lock is granted.
    pub extent: Extent,
    pub enqueue_flags: EnqueueFlags,
    pub flags: LockFlags,
    pub state: LockState,
    /// Local references (matches, in-flight I/O).
    pub refs: u32,
    pub page_size: u64,
    /// Eviction deadline while a blocking AST is outstanding.
    pub callback_deadline: Option<Instant>,
    pub ast: Arc<dyn AstHandler>,
    /// Grant notification for a queued request.
    pub notify: Option<oneshot::Sender<Result<GrantNotice>>>,
}

impl LockRecord {
    pub(crate) fn new(id: LockId, request: &EnqueueRequest, page_size: u64) -> Self {
        let mut flags = LockFlags::empty();
        if request.local {
            flags |= LockFlags::LOCAL;
        }
        Self {
            id,
            export: request.export,
            req_mode: request.mode,
            granted_mode: None,
            gid: request.gid,
            req_extent: request.extent,
            extent: request.extent,
            enqueue_flags: request.flags,
            flags,
            state: LockState::New,
            refs: 0,
            page_size: request.page_size.unwrap_or(page_size),
            callback_deadline: None,
            ast: Arc::clone(&request.ast),
            notify: None,
        }
    }

    /// Mode the lock holds (granted) or asks for (waiting).
    pub(crate) fn mode(&self) -> LockMode {
        self.granted_mode.unwrap_or(self.req_mode)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.flags.contains(LockFlags::DESTROYED)
    }

    /// A PR lock over the whole object, as taken for size glimpses.
    pub(crate) fn is_glimpse_shaped(&self) -> bool {
        self.mode() == LockMode::Pr && self.extent.is_whole_file()
    }

    pub(crate) fn info(&self, resource: ResourceId) -> LockInfo {
        LockInfo {
            id: self.id,
            resource,
            export: self.export,
            req_mode: self.req_mode,
            granted_mode: self.granted_mode,
            gid: self.gid,
            req_extent: self.req_extent,
            extent: self.extent,
            state: self.state,
            flags: self.flags.bits(),
            refs: self.refs,
        }
    }
}

/// Point-in-time description of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: LockId,
    pub resource: ResourceId,
    pub export: ExportId,
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub gid: Option<Gid>,
    pub req_extent: Extent,
    pub extent: Extent,
    pub state: LockState,
    /// Raw [`LockFlags`] bits.
    pub flags: u32,
    pub refs: u32,
}

impl LockInfo {
    pub fn lock_flags(&self) -> LockFlags {
        LockFlags::from_bits_truncate(self.flags)
    }
}

/// Handle to a lock owned by a resource.
#[derive(Clone)]
pub struct LockHandle {
    pub(crate) resource: Arc<Resource>,
    pub(crate) id: LockId,
}

impl LockHandle {
    pub(crate) fn new(resource: Arc<Resource>, id: LockId) -> Self {
        Self { resource, id }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Current state of the lock, or `None` once it has been freed.
    pub fn info(&self) -> Option<LockInfo> {
        self.resource.lock_info(self.id)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource.id())
            .field("id", &self.id)
            .finish()
    }
}

/// Lock request.
#[derive(Clone)]
pub struct EnqueueRequest {
    /// Who is requesting.
    pub export: ExportId,
    /// Requested mode.
    pub mode: LockMode,
    /// Requested extent.
    pub extent: Extent,
    /// Group id, required for GROUP locks.
    pub gid: Option<Gid>,
    pub flags: EnqueueFlags,
    /// Client page size; the namespace page size when unset.
    pub page_size: Option<u64>,
    /// Taken by the server on its own behalf.
    pub local: bool,
    /// Callbacks toward the holder.
    pub ast: Arc<dyn AstHandler>,
}

impl EnqueueRequest {
    /// Create a new lock request.
    pub fn new(export: ExportId, mode: LockMode, extent: Extent, ast: Arc<dyn AstHandler>) -> Self {
        Self {
            export,
            mode,
            extent,
            gid: None,
            flags: EnqueueFlags::empty(),
            page_size: None,
            local: false,
            ast,
        }
    }

    /// Group lock request.
    pub fn group(export: ExportId, gid: Gid, extent: Extent, ast: Arc<dyn AstHandler>) -> Self {
        Self::new(export, LockMode::Group, extent, ast).with_gid(gid)
    }

    pub fn with_gid(mut self, gid: Gid) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn with_flags(mut self, flags: EnqueueFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Mark as a server-local lock (never evicted on callback timeout).
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.extent.start > self.extent.end {
            return Err(DelmError::InvalidExtent {
                start: self.extent.start,
                end: self.extent.end,
            });
        }
        match (self.mode, self.gid) {
            (LockMode::Group, None) => {
                return Err(DelmError::InvalidArgument(
                    "GROUP lock requires a group id".to_string(),
                ))
            }
            (LockMode::Group, Some(_)) | (_, None) => {}
            (mode, Some(_)) => {
                return Err(DelmError::InvalidArgument(format!(
                    "group id given for {} lock",
                    mode
                )))
            }
        }
        if let Some(page_size) = self.page_size {
            if !page_size.is_power_of_two() {
                return Err(DelmError::InvalidArgument(format!(
                    "page size {} is not a power of two",
                    page_size
                )));
            }
        }
        self.flags.validate()
    }
}

impl fmt::Debug for EnqueueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequest")
            .field("export", &self.export)
            .field("mode", &self.mode)
            .field("extent", &self.extent)
            .field("gid", &self.gid)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Sent to a queued request when it is granted.
#[derive(Debug, Clone, Copy)]
pub struct GrantNotice {
    pub extent: Extent,
    pub mode: LockMode,
    pub flags: ReplyFlags,
}

/// A granted (or matched) lock.
#[derive(Debug, Clone)]
pub struct Grant {
    pub lock: LockHandle,
    pub extent: Extent,
    pub mode: LockMode,
    pub flags: ReplyFlags,
}

impl Grant {
    /// Whether expansion changed the extent.
    pub fn changed(&self) -> bool {
        self.flags.contains(ReplyFlags::LOCK_CHANGED)
    }

    pub fn matched(&self) -> bool {
        self.flags.contains(ReplyFlags::MATCHED)
    }
}

/// A request parked on the waiting list.
#[derive(Debug)]
pub struct Waiter {
    pub lock: LockHandle,
    pub flags: ReplyFlags,
    rx: oneshot::Receiver<Result<GrantNotice>>,
}

impl Waiter {
    pub(crate) fn new(
        lock: LockHandle,
        flags: ReplyFlags,
        rx: oneshot::Receiver<Result<GrantNotice>>,
    ) -> Self {
        Self { lock, flags, rx }
    }

    /// Wait for the grant.
    pub async fn wait(self) -> Result<Grant> {
        let lock = self.lock;
        match self.rx.await {
            Ok(Ok(notice)) => Ok(Grant {
                lock,
                extent: notice.extent,
                mode: notice.mode,
                flags: notice.flags,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DelmError::Interrupted),
        }
    }

    /// Wait for the grant at most `timeout`; on expiry the request is
    /// cancelled and `Interrupted` returned.
    pub async fn wait_timeout(self, ns: &LockNamespace, timeout: Duration) -> Result<Grant> {
        let lock = self.lock.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                ns.cancel(&lock).await;
                Err(DelmError::Interrupted)
            }
        }
    }
}

/// Conflicts found by a PEEK or GLIMPSE request.
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    /// Locks in the way of the request.
    pub holders: Vec<LockInfo>,
    /// Known minimum size of the object.
    pub kms: u64,
}

/// Result of an enqueue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Granted (or matched) immediately.
    Granted(Grant),
    /// Queued; the grant arrives through the [`Waiter`].
    Waiting(Waiter),
    /// PEEK/GLIMPSE request met conflicts; nothing was acquired.
    Conflict(ConflictReport),
    /// PEEK request met no conflict; nothing was acquired.
    Available,
}

impl EnqueueOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, EnqueueOutcome::Granted(_))
    }

    pub fn into_grant(self) -> Option<Grant> {
        match self {
            EnqueueOutcome::Granted(grant) => Some(grant),
            _ => None,
        }
    }

    pub fn into_waiter(self) -> Option<Waiter> {
        match self {
            EnqueueOutcome::Waiting(waiter) => Some(waiter),
            _ => None,
        }
    }
}

/// RAII reference on a matched lock.
///
/// Holds one local reference; dropping the guard releases it.
pub struct LockGuard {
    ns: Arc<LockNamespace>,
    grant: Grant,
    released: bool,
}

impl LockGuard {
    /// Create a new lock guard over a reference taken by a match.
    pub fn new(ns: Arc<LockNamespace>, grant: Grant) -> Self {
        Self {
            ns,
            grant,
            released: false,
        }
    }

    /// Get the matched lock.
    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    /// Release the reference explicitly.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.ns.release(&self.grant.lock).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let ns = Arc::clone(&self.ns);
            let lock = self.grant.lock.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = ns.release(&lock).await;
                });
            }
        }
    }
}

/// Match an existing lock and hold a reference on it while the guard lives.
pub async fn with_match(
    ns: Arc<LockNamespace>,
    resource: &Arc<Resource>,
    mode: LockMode,
    extent: Extent,
    gid: Option<Gid>,
) -> Result<LockGuard> {
    let grant = ns
        .match_lock(resource, mode, extent, gid, EnqueueFlags::empty())
        .ok_or(DelmError::WouldBlock)?;
    Ok(LockGuard::new(ns, grant))
}
