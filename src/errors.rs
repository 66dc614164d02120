//! Error types for the kernel's fallible operations.
//!
//! The kernel never panics on a recoverable failure; every fallible
//! operation returns one of the error kinds below (or an empty signal set
//! for the silently-absorbed signal misuses). Fatal invariant violations
//! are `debug_assert!`s and compile out of release builds.

use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level error for kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Thread creation errors.
    Spawn(SpawnError),
    /// Thread-pool errors.
    Pool(PoolError),
    /// Dynamic memory errors.
    Alloc(AllocError),
}

/// Errors that can occur while creating a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// No contiguous run of free pages large enough for the stack.
    OutOfMemory,
    /// The kernel has not been initialized yet.
    NotInitialized,
}

/// Errors that can occur when borrowing a thread from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every pool thread is currently running a job.
    Empty,
}

/// Errors reported by the paged allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No contiguous run of free pages satisfies the request.
    OutOfMemory,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Spawn(e) => write!(f, "spawn error: {}", e),
            KernelError::Pool(e) => write!(f, "pool error: {}", e),
            KernelError::Alloc(e) => write!(f, "allocation error: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "no stack memory available"),
            SpawnError::NotInitialized => write!(f, "kernel not initialized"),
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Empty => write!(f, "no pool thread available"),
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl From<SpawnError> for KernelError {
    fn from(error: SpawnError) -> Self {
        KernelError::Spawn(error)
    }
}

impl From<PoolError> for KernelError {
    fn from(error: PoolError) -> Self {
        KernelError::Pool(error)
    }
}

impl From<AllocError> for KernelError {
    fn from(error: AllocError) -> Self {
        KernelError::Alloc(error)
    }
}

impl From<AllocError> for SpawnError {
    fn from(_: AllocError) -> Self {
        SpawnError::OutOfMemory
    }
}
