//! Strata DELM - the distributed extent lock manager of Strata.
//!
//! The lock manager grants, tracks, revokes and compatibility-tests
//! byte-range locks over file objects, so that many clients can read and
//! write disjoint (or compatibly shared) regions of one object while
//! conflicting ranges stay strictly serialized.
//!
//! # Features
//!
//! - **Interval Forest**: One augmented interval tree per lock mode per resource.
//! - **Seven Lock Modes**: NL, CR, CW, PR, PW, EX and gid-qualified GROUP locks.
//! - **Extent Expansion**: Grants are widened to the largest compatible range.
//! - **Blocking Callbacks**: Conflicting holders are asked to give way (ASTs).
//! - **Contention Fallback**: Busy resources can deny locks with `EUSERS`.
//! - **KMS Tracking**: A known-minimum-size hint that survives cancellation.
//! - **Prolongation**: Locks covering live I/O escape eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LockNamespace                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Registry: ResourceId -> Resource (sharded, refcounted)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Resource: granted trees[mode] | waiting list | zombies     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Policy: compat | expand | kms           AST dispatch ──▶   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_delm::{
//!     DelmConfig, EnqueueOutcome, EnqueueRequest, ExportId, Extent, LocalAst, LockMode,
//!     LockNamespace, ResourceId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> strata_delm::Result<()> {
//!     let ns = LockNamespace::new(DelmConfig::development())?;
//!     let resource = ns.resource_get(ResourceId::new(0, 42));
//!
//!     let request = EnqueueRequest::new(
//!         ExportId(1),
//!         LockMode::Pw,
//!         Extent::new(0, 4095)?,
//!         Arc::new(LocalAst),
//!     );
//!     if let EnqueueOutcome::Granted(grant) = ns.enqueue(&resource, request).await? {
//!         println!("granted {}", grant.extent);
//!         ns.cancel(&grant.lock).await;
//!     }
//!
//!     ns.resource_put(&resource);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod ast;
pub mod flags;
pub mod interval;
pub mod lock;
pub mod mode;
pub mod namespace;
pub mod observability;
pub mod registry;
pub mod resource;

mod compat;
mod expand;
mod kms;

pub use ast::{AstHandler, BlockingAst, CompletionAst, GlimpseReply, LocalAst};
pub use config::DelmConfig;
pub use error::{DelmError, Result};
pub use flags::{EnqueueFlags, LockFlags, ReplyFlags};
pub use lock::{
    with_match, ConflictReport, EnqueueOutcome, EnqueueRequest, Grant, LockGuard, LockHandle,
    LockInfo, LockState, Waiter,
};
pub use mode::LockMode;
pub use namespace::{LockEvent, LockNamespace, NamespaceStats};
pub use resource::{Resource, ResourceSnapshot};
pub use types::{ExportId, Extent, Gid, LockId, ResourceId, OBJECT_EOF};
