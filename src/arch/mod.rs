//! Target abstraction for context switching and interrupt handling.
//!
//! Everything the scheduler needs from the hardware funnels through the
//! [`Arch`] trait: interrupt control, the stack-frame builder that makes a
//! fresh stack look like a suspended thread, and the single privileged
//! save/restore primitive shared by the preemption interrupt and the
//! cooperative yield path.

use crate::thread::ThreadRef;

/// The kernel function a prepared stack "returns into" on first restore.
pub type Trampoline = extern "C" fn() -> !;

/// Architecture abstraction.
///
/// # Safety
///
/// Implementations manipulate the stack pointer and interrupt state
/// directly; each unsafe method documents its own preconditions.
pub trait Arch {
    /// Bytes consumed by the initial context frame written by
    /// [`prepare_stack`](Arch::prepare_stack).
    const FRAME_BYTES: usize;

    /// `true` when interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Enables interrupt delivery.
    fn enable_interrupts();

    /// Disables interrupt delivery.
    fn disable_interrupts();

    /// The current stack pointer.
    fn read_sp() -> usize;

    /// Writes an initial context frame at the top of `stack` so that a
    /// context restore followed by interrupt-return arrives in
    /// `trampoline`. Returns the saved stack pointer to record for the
    /// thread.
    ///
    /// # Safety
    ///
    /// `stack` must be a writable region of at least
    /// [`FRAME_BYTES`](Arch::FRAME_BYTES) + alignment slack bytes.
    unsafe fn prepare_stack(stack_base: *mut u8, stack_len: usize, trampoline: Trampoline)
        -> usize;

    /// Saves the current execution context, records the resulting stack
    /// pointer through `save_sp`, and resumes the context whose saved
    /// stack pointer is `next_sp`. Returns when something later switches
    /// back to the saved context.
    ///
    /// # Safety
    ///
    /// Must be called with interrupts disabled. `next_sp` must be a stack
    /// pointer previously produced by this function or by
    /// [`prepare_stack`](Arch::prepare_stack).
    unsafe fn switch(save_sp: *mut usize, next_sp: usize);

    /// Invokes `hook(thread)` on a stack known to be intact, for use when
    /// `thread`'s own stack has overflowed.
    ///
    /// # Safety
    ///
    /// Must be called with interrupts disabled.
    unsafe fn call_on_safe_stack(hook: fn(ThreadRef), thread: ThreadRef);

    /// Arms the periodic millisecond timer that drives the two tick
    /// interrupts.
    fn start_timer();

    /// Low-power wait used by the default idle entry.
    fn idle_wait();
}

#[cfg(target_arch = "avr")]
pub mod avr;
#[cfg(not(target_arch = "avr"))]
pub mod host;

/// The architecture the crate was built for.
#[cfg(target_arch = "avr")]
pub type DefaultArch = avr::Avr;
/// The architecture the crate was built for.
#[cfg(not(target_arch = "avr"))]
pub type DefaultArch = host::HostArch;
