//! Fluent construction of new threads.

use core::ptr::NonNull;

use crate::arch::Arch;
use crate::config::MIN_STACK_BYTES;
use crate::errors::SpawnError;
use crate::kernel::Kernel;
use crate::synapse::Synapse;
use crate::thread::{ThreadEntry, ThreadFlags, ThreadRef};

/// Builder for a new thread.
///
/// ```ignore
/// let worker = ThreadBuilder::new(worker_entry)
///     .name("worker")
///     .stack_bytes(256)
///     .spawn()?;
/// ```
pub struct ThreadBuilder {
    pub(crate) entry: ThreadEntry,
    pub(crate) name: Option<&'static str>,
    pub(crate) stack_bytes: usize,
    pub(crate) flags: ThreadFlags,
    pub(crate) term_synapse: Option<NonNull<Synapse>>,
    pub(crate) exit_code_out: Option<NonNull<i16>>,
}

impl ThreadBuilder {
    /// Starts building a thread that will run `entry`.
    pub fn new(entry: ThreadEntry) -> Self {
        Self {
            entry,
            name: None,
            stack_bytes: MIN_STACK_BYTES,
            flags: ThreadFlags::READY | ThreadFlags::SELF_DESTRUCT,
            term_synapse: None,
            exit_code_out: None,
        }
    }

    /// Names the thread for diagnostics.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Requests a stack of at least `bytes` bytes. Rounded up to the
    /// configured minimum and then to whole pages.
    pub fn stack_bytes(mut self, bytes: usize) -> Self {
        self.stack_bytes = bytes;
        self
    }

    /// Replaces the default launch flags (`READY | SELF_DESTRUCT`).
    pub fn flags(mut self, flags: ThreadFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Fires `syn` when the thread terminates.
    ///
    /// # Safety
    ///
    /// `syn` must outlive the thread.
    pub unsafe fn notify(mut self, syn: &Synapse) -> Self {
        self.term_synapse = NonNull::new(syn as *const Synapse as *mut Synapse);
        self
    }

    /// Stores the thread's exit code through `out` when it terminates.
    ///
    /// # Safety
    ///
    /// `out` must remain valid until the thread terminates.
    pub unsafe fn exit_code(mut self, out: *mut i16) -> Self {
        self.exit_code_out = NonNull::new(out);
        self
    }

    /// Creates the thread on the global kernel.
    pub fn spawn(self) -> Result<ThreadRef, SpawnError> {
        crate::kernel::kernel().spawn(self)
    }

    /// Creates the thread on a specific kernel instance.
    pub fn spawn_on<A: Arch>(self, kernel: &Kernel<A>) -> Result<ThreadRef, SpawnError> {
        kernel.spawn(self)
    }
}
