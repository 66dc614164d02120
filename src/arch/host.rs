//! Host-side stand-in architecture.
//!
//! Used when the crate is compiled for anything other than the real
//! target, which in practice means the test suite. Context switches are
//! recorded rather than performed, so a "suspended" thread's bookkeeping
//! can be inspected while the test keeps executing; the interrupt flag is
//! a plain atomic. The synthetic stack frame mirrors the shape of the real
//! one (return slot at the top, zeroed register block below it) so the
//! prelude and reanimation logic are exercised byte for byte.

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{Arch, Trampoline};
use crate::thread::ThreadRef;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static SWITCH_COUNT: AtomicUsize = AtomicUsize::new(0);
static LAST_NEXT_SP: AtomicUsize = AtomicUsize::new(0);

/// Number of context switches performed since [`reset_switch_log`].
pub fn switch_count() -> usize {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

/// The `next_sp` argument of the most recent switch.
pub fn last_next_sp() -> usize {
    LAST_NEXT_SP.load(Ordering::Relaxed)
}

/// Clears the switch log.
pub fn reset_switch_log() {
    SWITCH_COUNT.store(0, Ordering::Relaxed);
    LAST_NEXT_SP.store(0, Ordering::Relaxed);
}

/// The host stand-in.
pub struct HostArch;

/// Synthetic frame: one `usize` return slot plus eight `usize` register
/// slots. Kept small enough to fit the minimum configured stack.
const WORD: usize = core::mem::size_of::<usize>();
const REGISTER_SLOTS: usize = 8;

impl Arch for HostArch {
    const FRAME_BYTES: usize = WORD * (1 + REGISTER_SLOTS);

    fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.load(Ordering::Relaxed)
    }

    fn enable_interrupts() {
        INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
    }

    fn disable_interrupts() {
        INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
    }

    fn read_sp() -> usize {
        // An address inside the current native stack frame is close enough
        // for the host: it is never inside a kernel-managed stack region,
        // so overflow checks stay quiet unless a test arranges otherwise.
        let marker = 0u8;
        &marker as *const u8 as usize
    }

    unsafe fn prepare_stack(
        stack_base: *mut u8,
        stack_len: usize,
        trampoline: Trampoline,
    ) -> usize {
        let top = stack_base as usize + stack_len;
        let sp = top - Self::FRAME_BYTES;

        unsafe {
            core::ptr::write_bytes(sp as *mut u8, 0, Self::FRAME_BYTES);
            // return slot at the very top of the frame
            let ret_slot = (top - WORD) as *mut usize;
            ret_slot.write_unaligned(trampoline as usize);
        }

        sp
    }

    unsafe fn switch(_save_sp: *mut usize, next_sp: usize) {
        SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
        LAST_NEXT_SP.store(next_sp, Ordering::Relaxed);
        // No actual transfer: execution continues in the caller so tests
        // can observe the scheduler's bookkeeping.
    }

    unsafe fn call_on_safe_stack(hook: fn(ThreadRef), thread: ThreadRef) {
        hook(thread);
    }

    fn start_timer() {}

    fn idle_wait() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn tramp() -> ! {
        unreachable!()
    }

    #[test]
    fn prepared_frame_embeds_trampoline_and_zeroes_registers() {
        let mut stack = [0xAAu8; 256];
        let base = stack.as_mut_ptr();

        let sp = unsafe { HostArch::prepare_stack(base, stack.len(), tramp) };

        let top = base as usize + stack.len();
        assert_eq!(sp, top - HostArch::FRAME_BYTES);

        let ret = unsafe { ((top - WORD) as *const usize).read_unaligned() };
        assert_eq!(ret, tramp as usize);

        // the register block below the return slot is zeroed
        for offset in 0..(HostArch::FRAME_BYTES - WORD) {
            assert_eq!(unsafe { *((sp + offset) as *const u8) }, 0);
        }
        // bytes below the frame are untouched
        assert_eq!(stack[0], 0xAA);
    }

    #[test]
    fn interrupt_flag_round_trip() {
        HostArch::enable_interrupts();
        assert!(HostArch::interrupts_enabled());
        HostArch::disable_interrupts();
        assert!(!HostArch::interrupts_enabled());
        HostArch::enable_interrupts();
    }
}
