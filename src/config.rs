//! Compile-time kernel configuration.
//!
//! Everything here is a `const` so that the whole kernel can be sized at
//! build time. Each constant is checked against its documented limits below;
//! an out-of-range value fails the build rather than the boot.

/// Milliseconds each thread may run before it is moved to the expired list.
pub const QUANTUM_TICKS: u8 = 5;

/// Granularity of the paged allocator, in bytes.
pub const PAGE_BYTES: usize = 16;

/// Size of the dynamically allocatable RAM region, in bytes.
pub const DYNAMIC_BYTES: usize = 8192;

/// Number of pages managed by the allocator.
pub const SRAM_PAGES: usize = DYNAMIC_BYTES / PAGE_BYTES;

/// Number of dormant threads kept in the pool.
pub const NUM_POOL_THREADS: usize = 2;

/// Stack size shared by every pool thread, in bytes.
pub const POOL_THREAD_STACK_BYTES: usize = 192;

/// Smallest stack the factory will carve. Requests below this are rounded up.
pub const MIN_STACK_BYTES: usize = 128;

/// Stack size for the idle thread, in bytes.
pub const IDLE_THREAD_STACK_BYTES: usize = 128;

/// Signal bits the kernel keeps for itself (`START`, `STOP`, `TIMEOUT`).
pub const NUM_RESERVED_SIGS: u16 = 3;

const _: () = assert!(QUANTUM_TICKS >= 2, "QUANTUM_TICKS must be two (2) or more");

const _: () = assert!(PAGE_BYTES.is_power_of_two(), "PAGE_BYTES must be a power of two");

const _: () = assert!(
    DYNAMIC_BYTES % PAGE_BYTES == 0,
    "DYNAMIC_BYTES must be a whole number of pages"
);

const _: () = assert!(
    POOL_THREAD_STACK_BYTES >= MIN_STACK_BYTES,
    "POOL_THREAD_STACK_BYTES is below the minimum stack size"
);

const _: () = assert!(
    NUM_POOL_THREADS * POOL_THREAD_STACK_BYTES < DYNAMIC_BYTES,
    "Thread pool consumes entire heap"
);

const _: () = assert!(NUM_RESERVED_SIGS >= 3, "START, STOP and TIMEOUT must fit");
