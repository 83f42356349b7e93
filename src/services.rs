//! Session-scoped collaborators handed to the compiler
//!
//! The bundle is owned by the caller. When a compile runs in the daemon, the
//! daemon reaches these through callback messages on the open connection for
//! the duration of that one call, so nothing here has to be shareable across
//! processes.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation, polled by the compiler at its own checkpoints
pub trait CancellationStatus: Send + Sync {
    fn is_canceled(&self) -> bool;
}

/// Shared cancellation cell
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// The underlying cell, for wiring to signal handlers
    pub fn shared(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

impl CancellationStatus for CancellationFlag {
    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read access to state kept between incremental builds
pub trait IncrementalStateProvider: Send + Sync {
    /// Look up a stored entry; `None` means the compiler has to rebuild it
    fn lookup(&self, key: &str) -> Option<Vec<u8>>;
}

/// Incremental state stored as one file per key under a cache directory
#[derive(Debug, Clone)]
pub struct DirectoryStateProvider {
    root: PathBuf,
}

impl DirectoryStateProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key);
        // Keys must stay inside the cache root
        let is_contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !is_contained {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl IncrementalStateProvider for DirectoryStateProvider {
    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.entry_path(key)?).ok()
    }
}

/// Everything the far side may consult while compiling one request
#[derive(Clone)]
pub struct CompilationServices {
    /// `None` for a clean, non-incremental compile
    pub incremental_state: Option<Arc<dyn IncrementalStateProvider>>,
    pub cancellation: Arc<dyn CancellationStatus>,
}

impl CompilationServices {
    /// Services for a clean compile with a fresh cancellation flag
    pub fn new() -> Self {
        Self {
            incremental_state: None,
            cancellation: Arc::new(CancellationFlag::new()),
        }
    }

    pub fn with_incremental_state(mut self, provider: Arc<dyn IncrementalStateProvider>) -> Self {
        self.incremental_state = Some(provider);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Arc<dyn CancellationStatus>) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental_state.is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_canceled()
    }

    pub fn lookup_state(&self, key: &str) -> Option<Vec<u8>> {
        self.incremental_state.as_ref()?.lookup(key)
    }
}

impl Default for CompilationServices {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompilationServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationServices")
            .field("incremental", &self.is_incremental())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
