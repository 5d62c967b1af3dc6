//! Error types for the Strata extent lock manager.
//!
//! This module provides a unified error type [`DelmError`] for all lock
//! manager operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Enqueue policy**: conflicts on non-blocking requests, contention denial
//! - **Waiting**: interrupted waits, callback timeouts
//! - **Lifecycle**: namespace shutdown, evicted exports, stale handles
//! - **Validation**: malformed extents, illegal modes or flag combinations
//! - **Configuration**: unreadable or invalid configuration files
//!
//! # Example
//!
//! ```rust
//! use strata_delm::error::DelmError;
//!
//! let err = DelmError::WouldBlock;
//! assert_eq!(err.to_errno(), libc::EAGAIN);
//! assert!(err.is_retryable());
//!
//! let err = DelmError::Contended;
//! assert_eq!(err.to_errno(), libc::EUSERS);
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for lock manager operations.
#[derive(Error, Debug)]
pub enum DelmError {
    // Enqueue policy errors
    #[error("Lock request would block")]
    WouldBlock,

    #[error("Resource is contended, use lockless I/O")]
    Contended,

    // Waiting errors
    #[error("Lock wait interrupted")]
    Interrupted,

    #[error("Blocking callback timed out for {0}")]
    CallbackTimeout(String),

    // Lifecycle errors
    #[error("Lock namespace is shutting down")]
    Shutdown,

    #[error("Export evicted: {0}")]
    ExportEvicted(u64),

    #[error("Stale lock handle: {0}")]
    StaleLock(u64),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    // Validation errors
    #[error("Invalid extent: start {start} > end {end}")]
    InvalidExtent { start: u64, end: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DelmError {
    /// Convert to a POSIX errno for the RPC reply.
    pub fn to_errno(&self) -> i32 {
        match self {
            DelmError::WouldBlock => libc::EAGAIN,
            DelmError::Contended => libc::EUSERS,
            DelmError::Interrupted => libc::EINTR,
            DelmError::CallbackTimeout(_) => libc::ETIMEDOUT,
            DelmError::Shutdown => libc::ESHUTDOWN,
            DelmError::ExportEvicted(_) => libc::ENOTCONN,
            DelmError::StaleLock(_) => libc::ESTALE,
            DelmError::OutOfMemory(_) => libc::ENOMEM,
            DelmError::InvalidExtent { .. } | DelmError::InvalidArgument(_) => libc::EINVAL,
            DelmError::Config(_) | DelmError::InvalidConfig { .. } => libc::EINVAL,
            DelmError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Check if the caller may simply retry the request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DelmError::WouldBlock | DelmError::Interrupted | DelmError::OutOfMemory(_)
        )
    }
}

impl From<serde_json::Error> for DelmError {
    fn from(e: serde_json::Error) -> Self {
        DelmError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for DelmError {
    fn from(e: toml::de::Error) -> Self {
        DelmError::Serialization(e.to_string())
    }
}

/// Result type alias for lock manager operations.
pub type Result<T> = std::result::Result<T, DelmError>;
