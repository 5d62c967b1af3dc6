//! Common test utilities for integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use strata_delm::{
    AstHandler, BlockingAst, CompletionAst, DelmConfig, DelmError, EnqueueRequest, ExportId,
    Extent, GlimpseReply, LockInfo, LockMode, LockNamespace, Result,
};

/// AST handler that records every callback it receives.
#[derive(Default)]
pub struct RecordingAst {
    pub blocking: Mutex<Vec<BlockingAst>>,
    pub completions: Mutex<Vec<CompletionAst>>,
    pub glimpses: Mutex<Vec<LockInfo>>,
    /// Size reported to glimpse callbacks.
    pub size: Mutex<u64>,
    /// Answer blocking callbacks with a timeout.
    pub unresponsive: bool,
}

impl RecordingAst {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unresponsive() -> Arc<Self> {
        Arc::new(Self {
            unresponsive: true,
            ..Default::default()
        })
    }

    pub fn with_size(size: u64) -> Arc<Self> {
        let ast = Self::default();
        *ast.size.lock() = size;
        Arc::new(ast)
    }

    pub fn blocking_count(&self) -> usize {
        self.blocking.lock().len()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().len()
    }
}

#[async_trait]
impl AstHandler for RecordingAst {
    async fn blocking(&self, ast: BlockingAst) -> Result<()> {
        self.blocking.lock().push(ast);
        if self.unresponsive {
            return Err(DelmError::CallbackTimeout("client did not answer".to_string()));
        }
        Ok(())
    }

    async fn completion(&self, ast: CompletionAst) -> Result<()> {
        self.completions.lock().push(ast);
        Ok(())
    }

    async fn glimpse(&self, lock: LockInfo) -> Result<GlimpseReply> {
        self.glimpses.lock().push(lock);
        Ok(GlimpseReply {
            size: *self.size.lock(),
        })
    }
}

/// Namespace with development settings.
pub fn namespace() -> Arc<LockNamespace> {
    LockNamespace::new(DelmConfig::development()).expect("valid config")
}

/// Namespace with custom settings.
pub fn namespace_with(f: impl FnOnce(&mut DelmConfig)) -> Arc<LockNamespace> {
    let mut config = DelmConfig::development();
    f(&mut config);
    LockNamespace::new(config).expect("valid config")
}

pub fn extent(start: u64, end: u64) -> Extent {
    Extent::new(start, end).expect("valid extent")
}

/// Request from `export` with a recording handler.
pub fn request(
    export: u64,
    mode: LockMode,
    start: u64,
    end: u64,
    ast: &Arc<RecordingAst>,
) -> EnqueueRequest {
    let handler: Arc<dyn AstHandler> = ast.clone();
    EnqueueRequest::new(ExportId(export), mode, extent(start, end), handler)
}
