#![no_std]
#![cfg_attr(target_arch = "avr", feature(abi_avr_interrupt))]
#![deny(unsafe_op_in_unsafe_fn)]

//! Signal-driven preemptive multitasking for small 8-bit microcontrollers.
//!
//! This crate is a microkernel for targets with tens of kilobytes of code
//! space and a few kilobytes of RAM. An application declares independent
//! threads of execution, each with its own stack carved from a paged
//! allocator; the kernel time-slices them off a millisecond timer and
//! coordinates them through per-thread signal bitfields.
//!
//! # Quick start
//!
//! ```ignore
//! use picokernel::{kernel, ThreadBuilder};
//!
//! fn blink() -> i16 {
//!     loop {
//!         toggle_led();
//!         picokernel::delay(picokernel::Duration::from_millis(500));
//!     }
//! }
//!
//! fn main() -> ! {
//!     kernel().init().expect("boot");
//!     ThreadBuilder::new(blink).name("blink").spawn().expect("spawn");
//!     kernel().start();
//! }
//! ```
//!
//! # Architecture
//!
//! - Two swapping ready lists plus an idle thread give round-robin
//!   scheduling with a head-of-list preference for freshly signalled
//!   threads.
//! - A delta-encoded timeout list makes the millisecond tick O(1) per
//!   sleeping thread.
//! - A bitmap paged allocator backs stacks (allocated top-down) and the
//!   heap (bottom-up).
//! - A fixed-size pool of pre-built thread descriptors serves
//!   fire-and-forget jobs without allocation.

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub(crate) mod list;
pub mod mem;
pub mod signal;
pub mod synapse;
pub mod thread;
pub mod time;

#[cfg(test)]
extern crate std;

extern crate alloc;

#[cfg(test)]
mod tests;

// Halt on panic: disable interrupts and sleep forever.
#[cfg(all(target_arch = "avr", not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    use crate::arch::Arch;

    arch::DefaultArch::disable_interrupts();
    loop {
        arch::DefaultArch::idle_wait();
    }
}

// ============================================================================
// Public API
// ============================================================================

pub use arch::{Arch, DefaultArch};

pub use kernel::{
    kernel, set_idle_entry, set_on_stack_overflow, set_on_thread_exit, Kernel,
};

pub use errors::{AllocError, KernelError, KernelResult, PoolError, SpawnError};

pub use mem::{Allocation, SearchStrategy};

pub use signal::SignalSet;

pub use synapse::Synapse;

pub use thread::{ThreadBuilder, ThreadEntry, ThreadFlags, ThreadRef, ThreadStatus};

pub use time::Duration;

// ============================================================================
// Convenience functions (global kernel)
// ============================================================================

/// Milliseconds since boot. Wraps after roughly 49 days.
pub fn now() -> u32 {
    kernel().now()
}

/// The currently executing thread, if the scheduler has started.
pub fn current() -> Option<ThreadRef> {
    kernel().current()
}

/// Waits on the calling thread for any of `sigs`.
pub fn wait(sigs: SignalSet) -> SignalSet {
    kernel().wait(sigs, None)
}

/// Waits on the calling thread for any of `sigs`, giving up after
/// `timeout` (the returned set then contains [`SignalSet::TIMEOUT`]).
pub fn wait_timeout(sigs: SignalSet, timeout: Duration) -> SignalSet {
    kernel().wait(sigs, Some(timeout))
}

/// Sleeps the calling thread.
pub fn delay(duration: Duration) {
    kernel().delay(duration);
}

/// Voluntarily hands the CPU to the next ready thread.
pub fn yield_now() {
    kernel().yield_now();
}

/// Suppresses preemption. Time keeps ticking and signals keep flowing.
/// Not reentrant; pair with [`permit`].
pub fn forbid() {
    kernel().forbid();
}

/// Re-enables preemption.
pub fn permit() {
    kernel().permit();
}

/// `true` while preemptive switching is enabled.
pub fn is_switching_enabled() -> bool {
    kernel().is_switching_enabled()
}
