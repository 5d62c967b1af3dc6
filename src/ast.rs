//! Asynchronous server tasks (ASTs): callbacks toward lock holders.
//!
//! The lock manager never talks to the network itself. Each lock carries an
//! [`AstHandler`] supplied by the layer that owns the client connection, and
//! the manager calls it after dropping the resource lock.

use crate::error::Result;
use crate::flags::ReplyFlags;
use crate::lock::LockInfo;
use async_trait::async_trait;
use std::sync::Arc;

/// Request to release (or downgrade) a granted lock.
#[derive(Debug, Clone)]
pub struct BlockingAst {
    /// The lock being revoked.
    pub lock: LockInfo,
    /// The request that conflicts with it, if known.
    pub blocker: Option<LockInfo>,
    /// The holder may drop dirty data instead of flushing it.
    pub discard_data: bool,
}

/// Notification that a queued lock has been granted.
#[derive(Debug, Clone)]
pub struct CompletionAst {
    pub lock: LockInfo,
    pub flags: ReplyFlags,
}

/// Answer to a glimpse callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlimpseReply {
    /// Size of the object as seen by the lock holder.
    pub size: u64,
}

/// Callbacks toward the holder of a lock.
///
/// `blocking` returning [`DelmError::CallbackTimeout`](crate::DelmError::CallbackTimeout)
/// is treated exactly like an expired callback timer: the lock is cancelled
/// by force and its export evicted.
#[async_trait]
pub trait AstHandler: Send + Sync {
    /// Ask the holder to give the lock back.
    async fn blocking(&self, ast: BlockingAst) -> Result<()>;

    /// Tell the holder its queued lock is now granted.
    async fn completion(&self, ast: CompletionAst) -> Result<()>;

    /// Ask a write-lock holder for its view of the object size.
    async fn glimpse(&self, lock: LockInfo) -> Result<GlimpseReply>;
}

/// Handler for locks taken by the server itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAst;

#[async_trait]
impl AstHandler for LocalAst {
    async fn blocking(&self, _ast: BlockingAst) -> Result<()> {
        Ok(())
    }

    async fn completion(&self, _ast: CompletionAst) -> Result<()> {
        Ok(())
    }

    async fn glimpse(&self, _lock: LockInfo) -> Result<GlimpseReply> {
        // Server-side writers report through update_kms instead.
        Ok(GlimpseReply::default())
    }
}

/// A callback collected under the resource lock, sent after it is dropped.
pub(crate) enum AstWork {
    Blocking {
        handler: Arc<dyn AstHandler>,
        ast: BlockingAst,
    },
    Completion {
        handler: Arc<dyn AstHandler>,
        ast: CompletionAst,
    },
}

impl AstWork {
    pub(crate) fn lock(&self) -> &LockInfo {
        match self {
            AstWork::Blocking { ast, .. } => &ast.lock,
            AstWork::Completion { ast, .. } => &ast.lock,
        }
    }
}
