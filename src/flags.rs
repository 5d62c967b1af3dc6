//! Enqueue, reply and internal lock flags.

use crate::error::{DelmError, Result};

bitflags::bitflags! {
    /// Flags supplied by the client with an enqueue request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnqueueFlags: u32 {
        /// Fail with `EAGAIN` instead of waiting.
        const NONBLOCK = 1 << 0;
        /// Pre-warming request; any conflict fails it.
        const SPECULATIVE = 1 << 1;
        /// Size/time sample only.
        const GLIMPSE = 1 << 2;
        /// Conflicting holders may drop their dirty data.
        const DISCARD_DATA = 1 << 3;
        /// A real lock is required even under the lockless policy.
        const MUST = 1 << 4;
        /// Test for conflicts without acquiring anything.
        const PEEK = 1 << 5;
        /// Succeed only by matching an existing granted lock.
        const LOCK_MATCH = 1 << 6;
        /// Grant exactly the requested extent.
        const LOCK_NO_EXPAND = 1 << 7;
        /// Allow denial with `EUSERS` when the resource is contended.
        const DENY_ON_CONTENTION = 1 << 8;
        /// No widening, but still align the extent to page boundaries.
        const ALIGN_NO_EXPAND = 1 << 9;
    }
}

impl EnqueueFlags {
    /// Whether a conflict must fail the request instead of queueing it.
    pub fn no_wait(self) -> bool {
        self.intersects(EnqueueFlags::NONBLOCK | EnqueueFlags::SPECULATIVE)
    }

    /// Reject contradictory combinations.
    pub fn validate(self) -> Result<()> {
        if self.contains(EnqueueFlags::PEEK | EnqueueFlags::LOCK_MATCH) {
            return Err(DelmError::InvalidArgument(
                "PEEK and LOCK_MATCH are mutually exclusive".to_string(),
            ));
        }
        if self.contains(EnqueueFlags::MUST | EnqueueFlags::DENY_ON_CONTENTION) {
            return Err(DelmError::InvalidArgument(
                "MUST cannot be combined with DENY_ON_CONTENTION".to_string(),
            ));
        }
        if self.contains(EnqueueFlags::LOCK_NO_EXPAND | EnqueueFlags::ALIGN_NO_EXPAND) {
            return Err(DelmError::InvalidArgument(
                "LOCK_NO_EXPAND and ALIGN_NO_EXPAND are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Flags returned to the client with the enqueue reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReplyFlags: u32 {
        /// Granted extent differs from the requested one.
        const LOCK_CHANGED = 1 << 0;
        /// The client must wait for the completion callback without timing out.
        const NO_TIMEOUT = 1 << 1;
        /// A blocking callback is pending on this lock right after grant.
        const BLOCK_PENDING = 1 << 2;
        /// The lock was found by matching rather than granted fresh.
        const MATCHED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Server-side state bits of a lock record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        /// A blocking AST has been sent (or is owed at grant time).
        const AST_SENT = 1 << 0;
        /// Lock is cancelled; no operation may use it.
        const DESTROYED = 1 << 1;
        /// Excluded from KMS computation.
        const KMS_IGNORE = 1 << 2;
        /// Lock taken by the server itself.
        const LOCAL = 1 << 3;
        /// Client acknowledged the blocking AST; cancel when unreferenced.
        const CANCEL_ON_RELEASE = 1 << 4;
        /// Cancelled by timeout or eviction rather than by the client.
        const FORCED = 1 << 5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_wait() {
        assert!(EnqueueFlags::NONBLOCK.no_wait());
        assert!(EnqueueFlags::SPECULATIVE.no_wait());
        assert!(!(EnqueueFlags::MUST | EnqueueFlags::GLIMPSE).no_wait());
    }

    #[test]
    fn test_validate() {
        assert!(EnqueueFlags::empty().validate().is_ok());
        assert!((EnqueueFlags::PEEK | EnqueueFlags::LOCK_MATCH).validate().is_err());
        assert!((EnqueueFlags::MUST | EnqueueFlags::DENY_ON_CONTENTION)
            .validate()
            .is_err());
        assert!((EnqueueFlags::NONBLOCK | EnqueueFlags::DENY_ON_CONTENTION)
            .validate()
            .is_ok());
    }
}
