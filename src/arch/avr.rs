//! AVR (megaAVR) implementation of the architecture layer.
//!
//! The context frame holds exactly what the switch primitive needs to
//! resume a thread mid-call: the callee-saved register file (r2–r17, r28,
//! r29), the status register, and the return address. Caller-saved
//! registers need no slots — from the resumed thread's point of view the
//! switch is an ordinary function call, and both tick interrupts preserve
//! the caller-saved set themselves before reaching the scheduler.
//!
//! Frame layout, from the top of the stack downward:
//!
//! ```text
//!   stack_top - 1   return address, low byte
//!   stack_top - 2   return address, high byte
//!   stack_top - 3   SREG
//!   stack_top - 4   r29
//!   ...             r28, r17, r16, ... r2
//!   stack_top - 21  r2
//! ```
//!
//! The saved stack pointer is one below the frame, exactly where AVR's
//! post-decrement `push` leaves it.

use core::arch::{asm, naked_asm};

use super::{Arch, Trampoline};
use crate::thread::ThreadRef;

/// I/O register addresses (megaAVR, data-space view).
const SREG: *mut u8 = 0x5F as *mut u8;
const SPL: *mut u8 = 0x5D as *mut u8;
const SPH: *mut u8 = 0x5E as *mut u8;

/// 8-bit Timer/Counter0.
const TCCR0A: *mut u8 = 0x44 as *mut u8;
const TCCR0B: *mut u8 = 0x45 as *mut u8;
const TCNT0: *mut u8 = 0x46 as *mut u8;
const OCR0A: *mut u8 = 0x47 as *mut u8;
const OCR0B: *mut u8 = 0x48 as *mut u8;
const TIMSK0: *mut u8 = 0x6E as *mut u8;

/// Top of SRAM, used as the safe stack for the overflow hook.
const RAMEND: u16 = 0x08FF;

/// CPU clock, Hz. The timer below assumes this value.
const F_CPU: u32 = 16_000_000;

/// Counts per millisecond with the /256 prescaler.
const TICKS_PER_MS: u8 = (F_CPU / 256 / 1_000 - 1) as u8;

const PC_BYTES: usize = 2;
const CALLEE_SAVED: usize = 18; // r2..r17, r28, r29

/// The AVR target.
pub struct Avr;

impl Arch for Avr {
    const FRAME_BYTES: usize = PC_BYTES + 1 + CALLEE_SAVED;

    fn interrupts_enabled() -> bool {
        unsafe { SREG.read_volatile() & 0x80 != 0 }
    }

    fn enable_interrupts() {
        unsafe { asm!("sei", options(nomem, nostack)) };
    }

    fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    fn read_sp() -> usize {
        let lo = unsafe { SPL.read_volatile() } as usize;
        let hi = unsafe { SPH.read_volatile() } as usize;
        (hi << 8) | lo
    }

    unsafe fn prepare_stack(
        stack_base: *mut u8,
        stack_len: usize,
        trampoline: Trampoline,
    ) -> usize {
        let top = stack_base as usize + stack_len;
        let addr = trampoline as usize;

        unsafe {
            // return address: `ret` pops high byte first
            ((top - 1) as *mut u8).write((addr & 0xFF) as u8);
            ((top - 2) as *mut u8).write((addr >> 8) as u8);
            // SREG with the I bit set, so the first restore enables
            // interrupts as it returns into the trampoline
            ((top - 3) as *mut u8).write(0x80);
            // zeroed callee-saved register block
            core::ptr::write_bytes((top - Self::FRAME_BYTES) as *mut u8, 0, CALLEE_SAVED);
        }

        top - Self::FRAME_BYTES - 1
    }

    unsafe fn switch(save_sp: *mut usize, next_sp: usize) {
        unsafe { switch_inner(save_sp as *mut u16, next_sp as u16) }
    }

    unsafe fn call_on_safe_stack(hook: fn(ThreadRef), thread: ThreadRef) {
        let saved = Self::read_sp() as u16;

        unsafe {
            SPL.write_volatile((RAMEND & 0xFF) as u8);
            SPH.write_volatile((RAMEND >> 8) as u8);
        }

        hook(thread);

        unsafe {
            SPL.write_volatile((saved & 0xFF) as u8);
            SPH.write_volatile((saved >> 8) as u8);
        }
    }

    fn start_timer() {
        unsafe {
            TCCR0B.write_volatile(0); // stop the clock
            TCNT0.write_volatile(0);
            TCCR0A.write_volatile(1 << 1); // CTC
            OCR0A.write_volatile(TICKS_PER_MS);
            OCR0B.write_volatile(TICKS_PER_MS);
            // OCIE0A (time tick) and OCIE0B (preemption)
            TIMSK0.write_volatile((1 << 1) | (1 << 2));
            TCCR0B.write_volatile(1 << 2); // /256 prescaler, go
        }
    }

    fn idle_wait() {
        unsafe { asm!("sleep", options(nomem, nostack)) };
    }
}

/// The save/restore primitive. Pushes the callee-saved set and SREG,
/// parks the resulting SP through `save_sp`, adopts `next_sp`, then pops
/// the new thread's frame and returns into it.
#[unsafe(naked)]
unsafe extern "C" fn switch_inner(save_sp: *mut u16, next_sp: u16) {
    // save_sp arrives in r25:r24, next_sp in r23:r22
    naked_asm!(
        "in r0, 0x3F",
        "push r0",
        "push r2",
        "push r3",
        "push r4",
        "push r5",
        "push r6",
        "push r7",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push r16",
        "push r17",
        "push r28",
        "push r29",
        // *save_sp = SP
        "movw r30, r24",
        "in r26, 0x3D",
        "in r27, 0x3E",
        "st z+, r26",
        "st z, r27",
        // SP = next_sp
        "out 0x3D, r22",
        "out 0x3E, r23",
        "pop r29",
        "pop r28",
        "pop r17",
        "pop r16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop r7",
        "pop r6",
        "pop r5",
        "pop r4",
        "pop r3",
        "pop r2",
        "pop r0",
        "out 0x3F, r0",
        "ret",
    );
}

/// Millisecond clock and timeout delivery.
#[no_mangle]
pub extern "avr-interrupt" fn __vector_14() {
    crate::kernel::kernel().tick_time();
}

/// Quantum accounting and preemption.
#[no_mangle]
pub extern "avr-interrupt" fn __vector_15() {
    crate::kernel::kernel().tick_preempt();
}

struct AvrCriticalSection;
critical_section::set_impl!(AvrCriticalSection);

// Single core: disabling interrupts is all a critical section needs.
unsafe impl critical_section::Impl for AvrCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let enabled = Avr::interrupts_enabled();
        Avr::disable_interrupts();
        enabled
    }

    unsafe fn release(was_enabled: critical_section::RawRestoreState) {
        if was_enabled {
            Avr::enable_interrupts();
        }
    }
}
