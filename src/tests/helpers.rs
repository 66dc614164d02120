//! Shared fixtures for the kernel tests.

use alloc::boxed::Box;

use crate::arch::DefaultArch;
use crate::kernel::Kernel;
use crate::thread::{ThreadBuilder, ThreadEntry, ThreadRef};

/// A fresh, private kernel instance. Leaked so tests can treat it as
/// `'static`, like the real one.
pub fn fresh_kernel() -> &'static Kernel<DefaultArch> {
    Box::leak(Box::new(Kernel::new()))
}

/// A fresh kernel with the idle thread and pool already built.
pub fn booted_kernel() -> &'static Kernel<DefaultArch> {
    let k = fresh_kernel();
    k.init().expect("init failed");
    k
}

pub fn nop_entry() -> i16 {
    0
}

/// Spawns a ready thread with default flags on `k`.
pub fn spawn_thread(k: &'static Kernel<DefaultArch>, name: &'static str) -> ThreadRef {
    spawn_with_entry(k, name, nop_entry)
}

pub fn spawn_with_entry(
    k: &'static Kernel<DefaultArch>,
    name: &'static str,
    entry: ThreadEntry,
) -> ThreadRef {
    ThreadBuilder::new(entry)
        .name(name)
        .spawn_on(k)
        .expect("spawn failed")
}

/// Simple linear congruential generator, good enough to shuffle
/// schedules deterministically.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    pub fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        min + (self.next_u64() % (max - min))
    }

    pub fn gen_bool(&mut self) -> bool {
        self.next_u64() & 1 == 0
    }
}
