//! Thread descriptors and the public thread handle.
//!
//! A [`Tcb`] is the kernel's per-thread control block: stack bounds, the
//! saved stack pointer, quantum accounting, the three signal bitfields and
//! the intrusive links that place the thread on exactly one kernel list at
//! a time. Applications never see a `Tcb` directly; they hold a cheap
//! [`ThreadRef`] and go through the kernel for every operation.

use core::ptr::NonNull;

use crate::signal::SignalSet;
use crate::synapse::Synapse;

pub mod builder;

pub use builder::ThreadBuilder;

/// Entry point for a thread. The returned value is the thread's exit code.
pub type ThreadEntry = fn() -> i16;

/// Launch flags controlling how a thread starts up and shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadFlags(u16);

impl ThreadFlags {
    /// No flags.
    pub const NONE: ThreadFlags = ThreadFlags(0);

    /// Insert the thread into the ready list as soon as it is created.
    pub const READY: ThreadFlags = ThreadFlags(1);

    /// The thread is a pool resident: recycled on exit instead of destroyed.
    pub const POOL: ThreadFlags = ThreadFlags(2);

    /// Release the descriptor and stack when the entry function returns.
    pub const SELF_DESTRUCT: ThreadFlags = ThreadFlags(4);

    /// `true` when every bit of `other` is set in `self`.
    pub const fn contains(self, other: ThreadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bits.
    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl core::ops::BitOr for ThreadFlags {
    type Output = ThreadFlags;

    fn bitor(self, rhs: ThreadFlags) -> ThreadFlags {
        ThreadFlags(self.0 | rhs.0)
    }
}

/// Coarse run state of a thread, as reported to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// The thread is executing right now.
    Running,
    /// The thread is on a ready list (or parked awaiting its first run).
    Ready,
    /// The thread is blocked in a wait.
    Waiting,
    /// The thread was stopped and is parked on `START`.
    Stopped,
    /// The entry function has returned and the descriptor was retained.
    Terminated,
}

/// Which kernel list a descriptor is currently linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueTag {
    /// Not on any list (blocked with no timeout, parked, or mid-transition).
    None,
    /// On one of the two ready lists; the payload is the list index.
    Ready(u8),
    /// On the timeout list.
    Sleeping,
    /// Dormant in the thread pool.
    Pool,
}

/// The per-thread control block.
///
/// All fields are mutated only inside a critical section, by the kernel.
pub(crate) struct Tcb {
    // Intrusive links. A descriptor is on at most one list at a time;
    // `queue` names that list.
    pub(crate) prev: Option<NonNull<Tcb>>,
    pub(crate) next: Option<NonNull<Tcb>>,
    pub(crate) queue: QueueTag,

    pub(crate) id: u16,
    pub(crate) name: Option<&'static str>,

    /// Lowest address of the stack region.
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,
    /// Saved top-of-stack while the thread is suspended.
    pub(crate) sp: usize,
    /// Lowest stack pointer ever saved for this thread.
    pub(crate) low_sp: usize,

    /// Milliseconds left in the current quantum.
    pub(crate) ticks_remaining: u8,
    /// Sleep time relative to the predecessor on the timeout list.
    pub(crate) timeout_offset: u32,

    pub(crate) flags: ThreadFlags,
    pub(crate) entry: Option<ThreadEntry>,
    /// Synapse to fire when the thread terminates. Must outlive the thread.
    pub(crate) term_synapse: Option<NonNull<Synapse>>,
    /// Where to store the exit code. Must outlive the thread.
    pub(crate) exit_code_out: Option<NonNull<i16>>,

    pub(crate) allocated_signals: SignalSet,
    pub(crate) waiting_signals: SignalSet,
    pub(crate) current_signals: SignalSet,

    /// Entry has returned and the descriptor was kept around.
    pub(crate) terminated: bool,

    #[cfg(feature = "instrumentation")]
    pub(crate) ticks_total: u32,
}

impl Tcb {
    pub(crate) const fn new(stack_base: *mut u8, stack_size: usize, flags: ThreadFlags) -> Tcb {
        Tcb {
            prev: None,
            next: None,
            queue: QueueTag::None,
            id: 0,
            name: None,
            stack_base,
            stack_size,
            sp: 0,
            low_sp: 0,
            ticks_remaining: 0,
            timeout_offset: 0,
            flags,
            entry: None,
            term_synapse: None,
            exit_code_out: None,
            allocated_signals: SignalSet::ALL_RESERVED,
            waiting_signals: SignalSet::EMPTY,
            current_signals: SignalSet::EMPTY,
            terminated: false,
            #[cfg(feature = "instrumentation")]
            ticks_total: 0,
        }
    }

    /// Signals that are both pending and being waited for.
    pub(crate) fn active_signals(&self) -> SignalSet {
        self.current_signals & self.waiting_signals
    }

    /// One past the highest address of the stack region.
    pub(crate) fn stack_top(&self) -> usize {
        self.stack_base as usize + self.stack_size
    }
}

/// A handle to a thread.
///
/// `ThreadRef` is a thin, copyable reference. It stays valid while the
/// thread is alive; for threads spawned with
/// [`ThreadFlags::SELF_DESTRUCT`], holding a handle past the thread's exit
/// is a contract violation (the kernel enforces the matching rule that a
/// thread frees all of its user signals before exiting, so no live
/// [`Synapse`] can outlast its thread).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    pub(crate) tcb: NonNull<Tcb>,
}

impl ThreadRef {
    pub(crate) fn from_tcb(tcb: NonNull<Tcb>) -> ThreadRef {
        ThreadRef { tcb }
    }

    /// The thread's id.
    pub fn id(self) -> u16 {
        critical_section::with(|_| unsafe { self.tcb.as_ref().id })
    }

    /// The thread's name, if it was given one.
    pub fn name(self) -> Option<&'static str> {
        critical_section::with(|_| unsafe { self.tcb.as_ref().name })
    }

    /// The size of the thread's stack, in bytes.
    pub fn stack_size_bytes(self) -> usize {
        unsafe { self.tcb.as_ref().stack_size }
    }

    /// The most stack the thread has ever used, in bytes.
    ///
    /// Measured at context-save points, so short-lived spikes between
    /// switches may go unrecorded.
    #[cfg(feature = "instrumentation")]
    pub fn stack_peak_usage_bytes(self) -> usize {
        critical_section::with(|_| {
            let tcb = unsafe { self.tcb.as_ref() };
            tcb.stack_top().saturating_sub(tcb.low_sp)
        })
    }

    /// Total milliseconds of CPU time this thread has received.
    #[cfg(feature = "instrumentation")]
    pub fn cpu_ticks(self) -> u32 {
        critical_section::with(|_| unsafe { self.tcb.as_ref().ticks_total })
    }

    // ------------------------------------------------------------------
    // Signal space management (pure per-thread state)
    // ------------------------------------------------------------------

    /// Allocates a signal from this thread's signal space and returns its
    /// mask.
    ///
    /// With `Some(number)` only that exact bit is claimed, and only if it
    /// is free and in range; with `None` the first free non-reserved bit
    /// is chosen. Returns the empty set on failure (out-of-range bit, bit
    /// already taken, or space saturated).
    pub fn allocate_signal(self, number: Option<u16>) -> SignalSet {
        critical_section::with(|_| {
            let tcb = unsafe { &mut *self.tcb.as_ptr() };

            let claim = |tcb: &mut Tcb, n: u16| {
                let mask = SignalSet::single(n);
                if !mask.is_empty() && !tcb.allocated_signals.intersects(mask) {
                    tcb.allocated_signals |= mask;
                    mask
                } else {
                    SignalSet::EMPTY
                }
            };

            match number {
                Some(n) => claim(&mut *tcb, n),
                None => {
                    // Reserved bits are always allocated, so start above them.
                    for n in crate::config::NUM_RESERVED_SIGS..SignalSet::WIDTH {
                        let mask = claim(&mut *tcb, n);
                        if !mask.is_empty() {
                            return mask;
                        }
                    }
                    SignalSet::EMPTY
                }
            }
        })
    }

    /// Returns signals to this thread's free space. Reserved bits are
    /// silently ignored; freeing an already-free bit is a no-op.
    pub fn free_signals(self, sigs: SignalSet) {
        critical_section::with(|_| {
            let tcb = unsafe { &mut *self.tcb.as_ptr() };
            let to_free = sigs.user_only();

            tcb.allocated_signals = tcb.allocated_signals.without(to_free);
            tcb.waiting_signals = tcb.waiting_signals.without(to_free);
            tcb.current_signals = tcb.current_signals.without(to_free);
        });
    }

    /// The signals currently allocated to this thread.
    pub fn allocated_signals(self, user_only: bool) -> SignalSet {
        critical_section::with(|_| {
            let allocated = unsafe { self.tcb.as_ref().allocated_signals };
            if user_only {
                allocated.user_only()
            } else {
                allocated
            }
        })
    }

    /// The signals currently pending on this thread.
    pub fn current_signals(self) -> SignalSet {
        critical_section::with(|_| unsafe { self.tcb.as_ref().current_signals })
    }

    /// Clears pending signals and returns the ones still set.
    pub fn clear_signals(self, sigs: SignalSet) -> SignalSet {
        critical_section::with(|_| {
            let tcb = unsafe { &mut *self.tcb.as_ptr() };
            tcb.current_signals = tcb.current_signals.without(sigs);
            tcb.current_signals
        })
    }

    // ------------------------------------------------------------------
    // Convenience forwarding to the global kernel
    // ------------------------------------------------------------------

    /// Sends signals to this thread. May be called from an interrupt.
    pub fn signal(self, sigs: SignalSet) {
        crate::kernel::kernel().signal(self, sigs);
    }

    /// Asks the thread to stop at its next (or current) wait.
    pub fn stop(self) {
        crate::kernel::kernel().stop(self);
    }

    /// Wakes the thread from a stop.
    pub fn restart(self) {
        crate::kernel::kernel().restart(self);
    }

    /// The thread's coarse run state.
    pub fn status(self) -> ThreadStatus {
        crate::kernel::kernel().status(self)
    }
}

impl core::fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ThreadRef(#{})", self.id())
    }
}

// ThreadRef is a capability handed across threads and into ISRs; all the
// state it touches is guarded by critical sections.
unsafe impl Send for ThreadRef {}
unsafe impl Sync for ThreadRef {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let f = ThreadFlags::READY | ThreadFlags::SELF_DESTRUCT;
        assert!(f.contains(ThreadFlags::READY));
        assert!(f.contains(ThreadFlags::SELF_DESTRUCT));
        assert!(!f.contains(ThreadFlags::POOL));
        assert!(f.contains(ThreadFlags::NONE));
    }

    #[test]
    fn fresh_tcb_owns_only_reserved_signals() {
        let tcb = Tcb::new(core::ptr::null_mut(), 256, ThreadFlags::NONE);
        assert_eq!(tcb.allocated_signals, SignalSet::ALL_RESERVED);
        assert!(tcb.waiting_signals.is_empty());
        assert!(tcb.current_signals.is_empty());
        assert_eq!(tcb.queue, QueueTag::None);
        assert!(tcb.active_signals().is_empty());
    }

    #[test]
    fn stack_top_is_base_plus_size() {
        let tcb = Tcb::new(0x100 as *mut u8, 0x80, ThreadFlags::NONE);
        assert_eq!(tcb.stack_top(), 0x180);
    }
}
