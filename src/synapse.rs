//! Synapses: one-way notification handles.
//!
//! A [`Synapse`] pairs a thread reference with a signal mask. The owning
//! thread creates one (allocating a free signal bit from its own signal
//! space) and hands it to whoever should be able to wake it — another
//! thread, a driver, an ISR. Firing a synapse is just signal delivery, so
//! it is safe from interrupt context.
//!
//! A synapse is a weak back-reference: it never keeps its thread alive.
//! Dropping it returns the signal bit to the owner, which is also what
//! makes the kernel's recycling rule work — a pool thread may not exit
//! while user signals are still allocated, because an outstanding synapse
//! would misdeliver into whatever job reanimates the descriptor next.

use crate::kernel::kernel;
use crate::signal::SignalSet;
use crate::thread::ThreadRef;
use crate::time::Duration;

/// A (thread, signal mask) pair usable as a notification destination.
pub struct Synapse {
    thread: ThreadRef,
    mask: SignalSet,
}

impl Synapse {
    /// Allocates a free user signal on the calling thread and wraps it.
    ///
    /// Returns `None` when called outside thread context or when the
    /// caller's signal space is saturated.
    pub fn new() -> Option<Synapse> {
        let me = kernel().current()?;
        let mask = me.allocate_signal(None);
        if mask.is_empty() {
            return None;
        }

        Some(Synapse { thread: me, mask })
    }

    /// Wraps an already-allocated signal on an arbitrary thread.
    #[cfg(any(test, feature = "std-shim"))]
    pub fn from_parts(thread: ThreadRef, mask: SignalSet) -> Synapse {
        Synapse { thread, mask }
    }

    /// The thread this synapse signals.
    pub fn thread(&self) -> ThreadRef {
        self.thread
    }

    /// The signal mask this synapse delivers.
    pub fn mask(&self) -> SignalSet {
        self.mask
    }

    /// Delivers the signal, waking the owner if it is waiting. May be
    /// called from an interrupt.
    pub fn fire(&self) {
        kernel().signal(self.thread, self.mask);
    }

    /// Clears any pending occurrence of the signal.
    pub fn clear(&self) {
        self.thread.clear_signals(self.mask);
    }

    /// Waits for the signal. Only the owning thread may call this; any
    /// other caller gets the empty set back.
    pub fn wait(&self) -> SignalSet {
        kernel().wait_on(self.thread, self.mask, None)
    }

    /// Waits for the signal with a timeout. The returned set tells the
    /// caller whether the signal or `TIMEOUT` (or both) woke it.
    pub fn wait_timeout(&self, timeout: Duration) -> SignalSet {
        kernel().wait_on(self.thread, self.mask, Some(timeout))
    }
}

impl Drop for Synapse {
    fn drop(&mut self) {
        self.thread.free_signals(self.mask);
    }
}
