//! The scheduler, context switcher and thread lifecycle.
//!
//! All scheduler state — the two ready lists, the timeout list, the pool,
//! the current-thread slot — lives in one [`Kernel`] value. On the target
//! there is exactly one, the global returned by [`kernel()`]; the test
//! suite builds private instances and drives them tick by tick.
//!
//! Two interrupt bodies hang off the same millisecond timer:
//! [`Kernel::tick_time`] advances the clock and expires sleepers, and
//! [`Kernel::tick_preempt`] does quantum accounting and forced switches.
//! The cooperative path ([`Kernel::yield_now`], used by `wait`, pool
//! recycling and thread exit) converges on the same save/restore
//! primitive.
//!
//! Locking discipline: every touch of scheduler or signal state happens
//! inside a critical section (interrupts off, prior state restored on
//! exit, nestable). The [`forbid`](Kernel::forbid)/[`permit`](Kernel::permit)
//! gate is different — it only suppresses the preemption decision, so the
//! clock keeps ticking and signals keep flowing while it is held.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr::{addr_of_mut, NonNull};

use critical_section::{CriticalSection, Mutex};
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::arch::{Arch, DefaultArch};
use crate::config::{
    DYNAMIC_BYTES, IDLE_THREAD_STACK_BYTES, MIN_STACK_BYTES, NUM_POOL_THREADS, PAGE_BYTES,
    POOL_THREAD_STACK_BYTES, QUANTUM_TICKS, SRAM_PAGES,
};
use crate::errors::{PoolError, SpawnError};
use crate::list::{ThreadList, TimeoutList};
use crate::mem::page_alloc::pages_for;
use crate::mem::{Allocation, PageMap, SearchStrategy};
use crate::signal::SignalSet;
use crate::synapse::Synapse;
use crate::thread::{
    QueueTag, Tcb, ThreadBuilder, ThreadEntry, ThreadFlags, ThreadRef, ThreadStatus,
};
use crate::time::Duration;

extern crate alloc;
use alloc::boxed::Box;

const MAP_BYTES: usize = SRAM_PAGES.div_ceil(8);

/// Mutable scheduler state. Only ever touched inside a critical section.
struct Sched {
    /// The two ready queues; `active_idx` names the active one.
    ready: [ThreadList; 2],
    active_idx: usize,
    /// Dormant pool descriptors awaiting a job.
    pool: ThreadList,
    /// Sleeping threads, ordered by time-to-expire.
    sleepers: TimeoutList,
    /// The thread executing right now. Stays linked at the head of the
    /// active list while it runs; `None` only before boot and during exit.
    current: Option<NonNull<Tcb>>,
    /// Runs when both ready lists are drained. Never queued.
    idle: Option<NonNull<Tcb>>,
    next_id: u16,
    initialized: bool,
}

impl Sched {
    const fn new() -> Sched {
        Sched {
            ready: [
                ThreadList::new(QueueTag::Ready(0)),
                ThreadList::new(QueueTag::Ready(1)),
            ],
            active_idx: 0,
            pool: ThreadList::new(QueueTag::Pool),
            sleepers: TimeoutList::new(),
            current: None,
            idle: None,
            next_id: 0,
            initialized: false,
        }
    }

    /// Unlinks `tcb` from whichever ready list it is on, if any.
    fn unlink_ready(&mut self, tcb: NonNull<Tcb>) {
        if let QueueTag::Ready(idx) = unsafe { tcb.as_ref().queue } {
            unsafe { self.ready[idx as usize].remove(tcb) };
        }
    }
}

/// The statically reserved RAM region behind the paged allocator.
#[repr(align(16))]
struct HeapRegion(UnsafeCell<[u8; DYNAMIC_BYTES]>);

const _: () = assert!(PAGE_BYTES <= 16, "heap region alignment is 16 bytes");

/// A preemptive multitasking kernel instance.
pub struct Kernel<A: Arch> {
    sched: Mutex<UnsafeCell<Sched>>,
    pages: Mutex<UnsafeCell<PageMap<MAP_BYTES>>>,
    region: HeapRegion,
    /// Milliseconds since boot; wraps after ~49 days.
    millis: AtomicU32,
    /// The `forbid`/`permit` gate read by the preemption tick.
    switching_enabled: AtomicBool,
    /// Context-save slot used when there is no current thread to save.
    boot_sp: UnsafeCell<usize>,
    /// One-shot guard so a second `init` is a harmless no-op.
    init_guard: spin::Once<()>,
    _arch: PhantomData<A>,
}

// All interior state is guarded by critical sections; the kernel runs on
// a single core.
unsafe impl<A: Arch> Send for Kernel<A> {}
unsafe impl<A: Arch> Sync for Kernel<A> {}

static GLOBAL_KERNEL: Kernel<DefaultArch> = Kernel::new();

/// The global kernel instance.
pub fn kernel() -> &'static Kernel<DefaultArch> {
    &GLOBAL_KERNEL
}

impl<A: Arch> Kernel<A> {
    /// Creates an empty, uninitialized kernel.
    pub const fn new() -> Kernel<A> {
        Kernel {
            sched: Mutex::new(UnsafeCell::new(Sched::new())),
            pages: Mutex::new(UnsafeCell::new(PageMap::new(SRAM_PAGES))),
            region: HeapRegion(UnsafeCell::new([0; DYNAMIC_BYTES])),
            millis: AtomicU32::new(0),
            switching_enabled: AtomicBool::new(true),
            boot_sp: UnsafeCell::new(0),
            init_guard: spin::Once::new(),
            _arch: PhantomData,
        }
    }

    /// Borrows the scheduler state. Call only inside a critical section,
    /// and let each borrow end before taking the next — the single core
    /// makes the exclusivity real, the discipline keeps it honest.
    #[allow(clippy::mut_from_ref)]
    fn sched(&self, cs: CriticalSection<'_>) -> &mut Sched {
        unsafe { &mut *self.sched.borrow(cs).get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn page_map(&self, cs: CriticalSection<'_>) -> &mut PageMap<MAP_BYTES> {
        unsafe { &mut *self.pages.borrow(cs).get() }
    }

    fn region_base(&self) -> *mut u8 {
        self.region.0.get() as *mut u8
    }

    // ------------------------------------------------------------------
    // Paged allocator
    // ------------------------------------------------------------------

    /// Allocates `bytes` rounded up to whole pages, searching in the
    /// direction `strategy` dictates. Returns `None` when no contiguous
    /// run of free pages is large enough.
    pub fn allocate(&self, bytes: usize, strategy: SearchStrategy) -> Option<Allocation> {
        let pages = pages_for(bytes);

        critical_section::with(|cs| {
            let map = self.page_map(cs);
            let start = map.find_free_run(pages, strategy)?;
            map.claim_run(start, pages);

            Some(Allocation {
                base: unsafe { self.region_base().add(start * PAGE_BYTES) },
                len: pages * PAGE_BYTES,
            })
        })
    }

    /// Returns a region obtained from [`allocate`](Kernel::allocate).
    /// `bytes` must be the originally requested length.
    pub fn free(&self, base: *mut u8, bytes: usize) {
        let offset = base as usize - self.region_base() as usize;
        debug_assert!(offset % PAGE_BYTES == 0, "free of unaligned base");
        debug_assert!(offset < DYNAMIC_BYTES, "free outside the heap region");

        critical_section::with(|cs| {
            self.page_map(cs)
                .release_run(offset / PAGE_BYTES, pages_for(bytes));
        });
    }

    /// Total number of pages under management.
    pub fn pages_total(&self) -> usize {
        critical_section::with(|cs| self.page_map(cs).total())
    }

    /// Number of pages currently allocated.
    pub fn pages_used(&self) -> usize {
        critical_section::with(|cs| self.page_map(cs).used())
    }

    /// Number of pages currently free.
    pub fn pages_free(&self) -> usize {
        critical_section::with(|cs| self.page_map(cs).free())
    }

    // ------------------------------------------------------------------
    // Clock and switching gate
    // ------------------------------------------------------------------

    /// Milliseconds since boot. Wraps after roughly 49 days.
    pub fn now(&self) -> u32 {
        self.millis.load(Ordering::Relaxed)
    }

    /// Suppresses preemptive context switching. Time keeps ticking and
    /// signals keep flowing; only the forced switch is deferred.
    ///
    /// Not reentrant — pair each `forbid` with exactly one
    /// [`permit`](Kernel::permit).
    pub fn forbid(&self) {
        self.switching_enabled.store(false, Ordering::Relaxed);
    }

    /// Re-enables preemptive context switching.
    pub fn permit(&self) {
        self.switching_enabled.store(true, Ordering::Relaxed);
    }

    /// `true` while preemptive switching is enabled.
    pub fn is_switching_enabled(&self) -> bool {
        self.switching_enabled.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Boot
    // ------------------------------------------------------------------

    /// Builds the idle thread and the thread pool. Call once, before any
    /// spawn, with the hooks already configured. A repeat call is a no-op.
    pub fn init(&self) -> Result<(), SpawnError> {
        let mut first = false;
        self.init_guard.call_once(|| first = true);
        if !first {
            return Ok(());
        }

        let idle = self.spawn_raw(
            Some("idle"),
            IDLE_THREAD_STACK_BYTES,
            Some(idle_entry()),
            ThreadFlags::NONE,
            None,
            None,
        )?;

        critical_section::with(|cs| {
            let s = self.sched(cs);
            s.idle = Some(idle.tcb);
            s.initialized = true;
        });

        for _ in 0..NUM_POOL_THREADS {
            self.spawn_raw(
                None,
                POOL_THREAD_STACK_BYTES,
                None,
                ThreadFlags::POOL,
                None,
                None,
            )?;
        }

        log::info!(
            "kernel up: {} pool threads, {} pages free",
            NUM_POOL_THREADS,
            self.pages_free()
        );

        Ok(())
    }

    /// Arms the millisecond timer and transfers control to the highest
    /// priority ready thread. Does not return on the target.
    pub fn start(&self) -> ! {
        A::start_timer();
        critical_section::with(|cs| self.do_yield(cs));

        // Only the host stand-in ever falls through the first switch.
        loop {
            A::idle_wait();
        }
    }

    // ------------------------------------------------------------------
    // Thread factory
    // ------------------------------------------------------------------

    /// Creates a thread from a [`ThreadBuilder`].
    pub fn spawn(&self, builder: ThreadBuilder) -> Result<ThreadRef, SpawnError> {
        let initialized = critical_section::with(|cs| self.sched(cs).initialized);
        if !initialized {
            return Err(SpawnError::NotInitialized);
        }

        self.spawn_raw(
            builder.name,
            builder.stack_bytes,
            Some(builder.entry),
            builder.flags,
            builder.term_synapse,
            builder.exit_code_out,
        )
    }

    fn spawn_raw(
        &self,
        name: Option<&'static str>,
        stack_bytes: usize,
        entry: Option<ThreadEntry>,
        flags: ThreadFlags,
        term_synapse: Option<NonNull<Synapse>>,
        exit_code_out: Option<NonNull<i16>>,
    ) -> Result<ThreadRef, SpawnError> {
        // Stacks are carved from the top of the region, away from heap data.
        let stack = self
            .allocate(stack_bytes.max(MIN_STACK_BYTES), SearchStrategy::TopDown)
            .ok_or(SpawnError::OutOfMemory)?;

        let tcb = Box::new(Tcb::new(stack.base, stack.len, flags));
        let ptr = NonNull::from(Box::leak(tcb));

        critical_section::with(|cs| {
            if flags.contains(ThreadFlags::POOL) {
                // Dormant shell: no identity and no prelude until a job
                // reanimates it.
                let s = self.sched(cs);
                unsafe { s.pool.append(ptr) };
            } else {
                self.reanimate(cs, ptr, name, entry, flags, term_synapse, exit_code_out);
                if flags.contains(ThreadFlags::READY) {
                    let s = self.sched(cs);
                    unsafe { s.ready[s.active_idx].append(ptr) };
                }
            }
        });

        log::trace!("spawned thread {:?}", name.unwrap_or("?"));
        Ok(ThreadRef::from_tcb(ptr))
    }

    /// Takes a dormant thread from the pool, points it at `entry` and puts
    /// it at the head of the active ready list.
    pub fn from_pool(
        &self,
        name: Option<&'static str>,
        entry: ThreadEntry,
    ) -> Result<ThreadRef, PoolError> {
        // No termination synapse and no exit-code slot: nothing to outlive.
        unsafe { self.from_pool_notify(name, entry, None, None) }
    }

    /// [`from_pool`](Kernel::from_pool) with a termination synapse and an
    /// exit-code slot.
    ///
    /// # Safety
    ///
    /// `term_synapse` and `exit_code_out`, when present, must remain valid
    /// until the job terminates.
    pub unsafe fn from_pool_notify(
        &self,
        name: Option<&'static str>,
        entry: ThreadEntry,
        term_synapse: Option<&Synapse>,
        exit_code_out: Option<*mut i16>,
    ) -> Result<ThreadRef, PoolError> {
        let term = term_synapse.and_then(|s| NonNull::new(s as *const Synapse as *mut Synapse));
        let exit = exit_code_out.and_then(NonNull::new);

        critical_section::with(|cs| {
            let shell = {
                let s = self.sched(cs);
                let Some(shell) = s.pool.head() else {
                    log::trace!("pool empty");
                    return Err(PoolError::Empty);
                };
                unsafe { s.pool.remove(shell) };
                shell
            };

            self.reanimate(
                cs,
                shell,
                name,
                Some(entry),
                ThreadFlags::READY | ThreadFlags::POOL,
                term,
                exit,
            );

            // Jobs jump the queue so fire-and-forget work starts promptly.
            let s = self.sched(cs);
            unsafe { s.ready[s.active_idx].prepend(shell) };

            Ok(ThreadRef::from_tcb(shell))
        })
    }

    /// Rewrites a descriptor's identity, signals and stack prelude so the
    /// next context restore launches it at `entry`.
    fn reanimate(
        &self,
        cs: CriticalSection<'_>,
        ptr: NonNull<Tcb>,
        name: Option<&'static str>,
        entry: Option<ThreadEntry>,
        flags: ThreadFlags,
        term_synapse: Option<NonNull<Synapse>>,
        exit_code_out: Option<NonNull<i16>>,
    ) {
        let id = {
            let s = self.sched(cs);
            let id = s.next_id;
            s.next_id = s.next_id.wrapping_add(1);
            id
        };

        let tcb = unsafe { &mut *ptr.as_ptr() };
        tcb.id = id;
        tcb.name = name;
        tcb.entry = entry;
        tcb.flags = flags;
        tcb.term_synapse = term_synapse;
        tcb.exit_code_out = exit_code_out;

        tcb.sp = unsafe { A::prepare_stack(tcb.stack_base, tcb.stack_size, global_thread_entry) };
        tcb.low_sp = tcb.sp;

        tcb.allocated_signals = SignalSet::ALL_RESERVED;
        tcb.waiting_signals = SignalSet::EMPTY;
        tcb.current_signals = SignalSet::EMPTY;
        tcb.timeout_offset = 0;
        tcb.ticks_remaining = 0;
        tcb.terminated = false;
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// The thread executing right now.
    pub fn current(&self) -> Option<ThreadRef> {
        critical_section::with(|cs| self.sched(cs).current.map(ThreadRef::from_tcb))
    }

    /// Head of the active list; swap lists when it drains; idle as the
    /// last resort.
    fn select_next(s: &mut Sched) -> NonNull<Tcb> {
        if let Some(head) = s.ready[s.active_idx].head() {
            return head;
        }

        s.active_idx ^= 1;
        match s.ready[s.active_idx].head() {
            Some(head) => head,
            None => s.idle.expect("kernel not initialized"),
        }
    }

    /// Records the low-water mark for the thread being suspended and runs
    /// the overflow hook if its stack pointer has escaped the stack.
    fn note_context_save(&self, ptr: NonNull<Tcb>) {
        let (observed, base) = {
            let tcb = unsafe { &mut *ptr.as_ptr() };

            // Outside the region (possible only on the host stand-in,
            // whose native stack is elsewhere) fall back to the saved
            // value.
            let sp_now = A::read_sp();
            let observed = if sp_now <= tcb.stack_top() {
                sp_now
            } else {
                tcb.sp
            };

            tcb.low_sp = tcb.low_sp.min(observed);
            (observed, tcb.stack_base as usize)
        };

        if observed < base {
            log::warn!("stack overflow on thread #{}", unsafe { ptr.as_ref().id });
            unsafe { A::call_on_safe_stack(stack_overflow_hook(), ThreadRef::from_tcb(ptr)) };
        }
    }

    /// The cooperative switch. Removes the current thread from the active
    /// list (parking it on the timeout list when it asked to sleep), picks
    /// the next thread and restores it. Returns when the suspended thread
    /// is switched back in.
    fn do_yield(&self, cs: CriticalSection<'_>) {
        let current = self.sched(cs).current.take();

        let save_sp = match current {
            Some(cur) => {
                self.note_context_save(cur);

                let timeout = {
                    let tcb = unsafe { cur.as_ref() };
                    tcb.timeout_offset
                };

                let s = self.sched(cs);
                s.unlink_ready(cur);
                if timeout > 0 {
                    unsafe { s.sleepers.insert_by_offset(cur, timeout) };
                }

                unsafe { addr_of_mut!((*cur.as_ptr()).sp) }
            }
            None => self.boot_sp.get(),
        };

        let next_sp = {
            let s = self.sched(cs);
            let next = Self::select_next(s);
            s.current = Some(next);
            unsafe { next.as_ref().sp }
        };

        unsafe { A::switch(save_sp, next_sp) };
    }

    /// Voluntarily hands the CPU to the next ready thread, keeping the
    /// caller runnable at the back of the expired list.
    pub fn yield_now(&self) {
        critical_section::with(|cs| {
            let Some(cur) = self.sched(cs).current else {
                return;
            };

            self.note_context_save(cur);

            let next = {
                let s = self.sched(cs);
                if s.idle != Some(cur) {
                    s.unlink_ready(cur);
                    let expired = s.active_idx ^ 1;
                    unsafe { s.ready[expired].append(cur) };
                }
                let next = Self::select_next(s);
                s.current = Some(next);
                next
            };

            if next != cur {
                let save_sp = unsafe { addr_of_mut!((*cur.as_ptr()).sp) };
                let next_sp = unsafe { next.as_ref().sp };
                unsafe { A::switch(save_sp, next_sp) };
            }
        });
    }

    /// ISR A: advances the millisecond clock and wakes expired sleepers.
    ///
    /// Only the head of the timeout list is ever decremented; every
    /// successor's expiry is a delta off its predecessor.
    pub fn tick_time(&self) {
        self.millis.fetch_add(1, Ordering::Relaxed);

        critical_section::with(|cs| {
            let s = self.sched(cs);

            if let Some(head) = s.sleepers.head() {
                let tcb = unsafe { &mut *head.as_ptr() };
                if tcb.timeout_offset > 0 {
                    tcb.timeout_offset -= 1;
                }
            }

            while let Some(head) = s.sleepers.head() {
                if unsafe { head.as_ref().timeout_offset } != 0 {
                    break;
                }
                unsafe { s.sleepers.remove(head) };
                Self::deliver_signal(s, head, SignalSet::TIMEOUT);
            }
        });
    }

    /// ISR B: quantum accounting and preemption.
    pub fn tick_preempt(&self) {
        critical_section::with(|cs| {
            let Some(cur) = self.sched(cs).current else {
                return;
            };

            let keep_running = {
                let s = self.sched(cs);
                let at_head = s.ready[s.active_idx].head() == Some(cur);
                let switching = self.is_switching_enabled();

                let tcb = unsafe { &mut *cur.as_ptr() };

                #[cfg(feature = "instrumentation")]
                {
                    tcb.ticks_total = tcb.ticks_total.wrapping_add(1);
                }

                if tcb.ticks_remaining > 0 {
                    tcb.ticks_remaining -= 1;
                }

                // Head-of-list preference: a freshly signalled thread is
                // prepended to the active list, so anyone it displaced
                // loses the rest of their quantum.
                if switching && !at_head {
                    tcb.ticks_remaining = 0;
                }

                tcb.ticks_remaining > 0 || !switching
            };

            if keep_running {
                return;
            }

            self.note_context_save(cur);

            let next = {
                let s = self.sched(cs);

                // Quantum spent: to the back of the expired list. Idle is
                // never queued.
                if s.idle != Some(cur) {
                    s.unlink_ready(cur);
                    let expired = s.active_idx ^ 1;
                    unsafe { s.ready[expired].append(cur) };
                }

                let next = Self::select_next(s);
                s.current = Some(next);
                next
            };

            {
                let tcb = unsafe { &mut *next.as_ptr() };
                if tcb.ticks_remaining == 0 {
                    tcb.ticks_remaining = QUANTUM_TICKS;
                }
            }

            if next != cur {
                let save_sp = unsafe { addr_of_mut!((*cur.as_ptr()).sp) };
                let next_sp = unsafe { next.as_ref().sp };
                unsafe { A::switch(save_sp, next_sp) };
            }
        });
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Sends signals to a thread, possibly waking it.
    ///
    /// The only kernel entry point that may be invoked from an interrupt.
    pub fn signal(&self, thread: ThreadRef, sigs: SignalSet) {
        critical_section::with(|cs| {
            Self::deliver_signal(self.sched(cs), thread.tcb, sigs);
        });
    }

    /// Core signal delivery. Sets the bits (restricted to the target's
    /// allocated set) and, when that makes a blocked thread runnable,
    /// hoists it to the head of the active list.
    fn deliver_signal(s: &mut Sched, target: NonNull<Tcb>, sigs: SignalSet) {
        let queue = {
            let tcb = unsafe { &mut *target.as_ptr() };
            let was_runnable = !tcb.active_signals().is_empty();
            tcb.current_signals |= sigs & tcb.allocated_signals;

            // Wake only on the edge: the target is someone else, had no
            // live wake condition before, and has one now.
            if s.current == Some(target) || was_runnable || tcb.active_signals().is_empty() {
                return;
            }
            tcb.queue
        };

        match queue {
            QueueTag::Sleeping => {
                unsafe { s.sleepers.remove(target) };
                unsafe { &mut *target.as_ptr() }.timeout_offset = 0;
            }
            QueueTag::Ready(idx) => unsafe { s.ready[idx as usize].remove(target) },
            QueueTag::Pool => return, // dormant shells cannot be woken
            QueueTag::None => {}
        }

        unsafe { s.ready[s.active_idx].prepend(target) };
    }

    /// Waits for any of `sigs` on the calling thread. See
    /// [`wait_on`](Kernel::wait_on).
    pub fn wait(&self, sigs: SignalSet, timeout: Option<Duration>) -> SignalSet {
        match self.current() {
            Some(me) => self.wait_on(me, sigs, timeout),
            None => SignalSet::EMPTY,
        }
    }

    /// Waits until any of `sigs` (or a reserved signal) fires on `thread`.
    ///
    /// Only the thread itself may wait on its own signals; any other
    /// caller gets the empty set back. Unless `sigs` includes `START`,
    /// the kernel listens for `STOP` as well, and a delivered `STOP`
    /// parks the thread on `START` before returning (cooperative stop).
    /// With a timeout, `TIMEOUT` is armed and delivered by the clock tick.
    pub fn wait_on(
        &self,
        thread: ThreadRef,
        sigs: SignalSet,
        timeout: Option<Duration>,
    ) -> SignalSet {
        critical_section::with(|cs| self.wait_inner(cs, thread.tcb, sigs, timeout))
    }

    fn wait_inner(
        &self,
        cs: CriticalSection<'_>,
        target: NonNull<Tcb>,
        sigs: SignalSet,
        timeout: Option<Duration>,
    ) -> SignalSet {
        if self.sched(cs).current != Some(target) {
            return SignalSet::EMPTY;
        }

        {
            let tcb = unsafe { &mut *target.as_ptr() };
            tcb.waiting_signals = sigs;

            // A thread not explicitly waiting to be started is always
            // willing to be stopped.
            if !sigs.intersects(SignalSet::START) {
                tcb.waiting_signals |= SignalSet::STOP;
            }

            tcb.timeout_offset = timeout.map_or(0, |d| d.as_millis());
            if tcb.timeout_offset > 0 {
                tcb.waiting_signals |= SignalSet::TIMEOUT;
            } else {
                tcb.waiting_signals = tcb.waiting_signals.without(SignalSet::TIMEOUT);
            }

            // Only signals the thread actually owns can wake it.
            tcb.waiting_signals &= tcb.allocated_signals;
            if tcb.waiting_signals.is_empty() {
                return SignalSet::EMPTY;
            }
        }

        let mut fired = unsafe { target.as_ref().active_signals() };

        if fired.is_empty() {
            // Nothing pending: block until a signal or the timeout wakes
            // us. Execution resumes right here.
            self.do_yield(cs);
            fired = unsafe { target.as_ref().active_signals() };
        }

        {
            let tcb = unsafe { &mut *target.as_ptr() };
            // Clear what we consumed so repeats are observable.
            tcb.current_signals = tcb.current_signals.without(fired);
            // Disarm the timeout — unless the thread is still parked on
            // the timeout list (host stand-in only, where the blocking
            // switch returns immediately), in which case the field is the
            // list's delta and must survive.
            if tcb.queue != QueueTag::Sleeping {
                tcb.timeout_offset = 0;
            }
        }

        // Cooperative stop: park on START, then report the original wake.
        if fired.intersects(SignalSet::STOP) {
            self.wait_inner(cs, target, SignalSet::START, None);
        }

        fired
    }

    /// Sleeps the calling thread for `duration`.
    pub fn delay(&self, duration: Duration) {
        self.wait(SignalSet::EMPTY, Some(duration));
    }

    /// Asks `thread` to stop. Effective only while it is waiting with
    /// `STOP` in its mask (the default for every wait).
    pub fn stop(&self, thread: ThreadRef) {
        let listening = critical_section::with(|_| unsafe {
            thread
                .tcb
                .as_ref()
                .waiting_signals
                .intersects(SignalSet::STOP)
        });
        if listening {
            self.signal(thread, SignalSet::STOP);
        }
    }

    /// Restarts a stopped thread.
    pub fn restart(&self, thread: ThreadRef) {
        let listening = critical_section::with(|_| unsafe {
            thread
                .tcb
                .as_ref()
                .waiting_signals
                .intersects(SignalSet::START)
        });
        if listening {
            self.signal(thread, SignalSet::START);
        }
    }

    /// Reports the thread's coarse run state.
    pub fn status(&self, thread: ThreadRef) -> ThreadStatus {
        critical_section::with(|cs| {
            let is_current = self.sched(cs).current == Some(thread.tcb);
            let tcb = unsafe { thread.tcb.as_ref() };

            if is_current {
                ThreadStatus::Running
            } else if tcb.terminated {
                ThreadStatus::Terminated
            } else if tcb.waiting_signals.intersects(SignalSet::START) {
                ThreadStatus::Stopped
            } else if !tcb.waiting_signals.is_empty() {
                ThreadStatus::Waiting
            } else {
                ThreadStatus::Ready
            }
        })
    }

    // ------------------------------------------------------------------
    // End of life
    // ------------------------------------------------------------------

    /// Final phase of the trampoline: retire the current thread and hand
    /// the CPU over. `exit_code` is what the entry function returned.
    fn retire_current(&self, exit_code: i16) {
        critical_section::with(|cs| {
            let cur = self
                .sched(cs)
                .current
                .expect("retire with no current thread");

            let (flags, term, exit_out) = {
                let tcb = unsafe { cur.as_ref() };
                (tcb.flags, tcb.term_synapse, tcb.exit_code_out)
            };

            // A pool thread exiting with user signals still allocated
            // means a Synapse out there still references this descriptor —
            // recycling it would misdeliver signals to the next job.
            if flags.contains(ThreadFlags::POOL) {
                let leaked = unsafe { cur.as_ref().allocated_signals.user_only() };
                debug_assert!(leaked.is_empty(), "pool thread leaked signals");
                if !leaked.is_empty() {
                    log::warn!(
                        "pool thread #{} leaked signals {:?}",
                        unsafe { cur.as_ref().id },
                        leaked
                    );
                }
            }

            if let Some(out) = exit_out {
                unsafe { out.as_ptr().write(exit_code) };
            }

            if let Some(syn) = term {
                let (thread, mask) = {
                    let syn = unsafe { syn.as_ref() };
                    (syn.thread(), syn.mask())
                };
                Self::deliver_signal(self.sched(cs), thread.tcb, mask);
            }

            {
                let s = self.sched(cs);
                s.unlink_ready(cur);
                s.current = None;
            }

            thread_exit_hook()(ThreadRef::from_tcb(cur), exit_code);

            if flags.contains(ThreadFlags::POOL) {
                let s = self.sched(cs);
                unsafe { s.pool.append(cur) };
            } else if flags.contains(ThreadFlags::SELF_DESTRUCT) {
                let tcb = unsafe { Box::from_raw(cur.as_ptr()) };
                self.free(tcb.stack_base, tcb.stack_size);
                drop(tcb);
            } else {
                unsafe { &mut *cur.as_ptr() }.terminated = true;
            }

            self.do_yield(cs);
        });
    }
}

/// State introspection and direct control for the test suite, which
/// drives private kernel instances through the host architecture's
/// recording switch.
#[cfg(any(test, feature = "std-shim"))]
impl<A: Arch> Kernel<A> {
    /// Ids on the active ready list, head first.
    pub fn active_ids(&self) -> alloc::vec::Vec<u16> {
        critical_section::with(|cs| {
            let s = self.sched(cs);
            s.ready[s.active_idx]
                .iter()
                .map(|n| unsafe { n.as_ref().id })
                .collect()
        })
    }

    /// Ids on the expired ready list, head first.
    pub fn expired_ids(&self) -> alloc::vec::Vec<u16> {
        critical_section::with(|cs| {
            let s = self.sched(cs);
            s.ready[s.active_idx ^ 1]
                .iter()
                .map(|n| unsafe { n.as_ref().id })
                .collect()
        })
    }

    /// (id, relative offset) pairs on the timeout list, head first.
    pub fn sleeper_offsets(&self) -> alloc::vec::Vec<(u16, u32)> {
        critical_section::with(|cs| {
            self.sched(cs)
                .sleepers
                .iter()
                .map(|n| unsafe { (n.as_ref().id, n.as_ref().timeout_offset) })
                .collect()
        })
    }

    /// Number of dormant descriptors in the pool.
    pub fn pool_len(&self) -> usize {
        critical_section::with(|cs| self.sched(cs).pool.len())
    }

    /// The idle thread, once `init` has run.
    pub fn idle_thread(&self) -> Option<ThreadRef> {
        critical_section::with(|cs| self.sched(cs).idle.map(ThreadRef::from_tcb))
    }

    /// Installs `thread` as the running thread, as if it had just been
    /// switched in.
    pub fn set_current_for_test(&self, thread: Option<ThreadRef>) {
        critical_section::with(|cs| self.sched(cs).current = thread.map(|t| t.tcb));
    }

    /// Runs the selection policy once and installs the result.
    pub fn select_next_for_test(&self) -> ThreadRef {
        critical_section::with(|cs| {
            let s = self.sched(cs);
            let next = Self::select_next(s);
            s.current = Some(next);
            ThreadRef::from_tcb(next)
        })
    }

    /// Overwrites a thread's saved stack pointer.
    pub fn set_saved_sp_for_test(&self, thread: ThreadRef, sp: usize) {
        critical_section::with(|_| {
            let tcb = unsafe { &mut *thread.tcb.as_ptr() };
            tcb.sp = sp;
            tcb.low_sp = tcb.low_sp.min(sp);
        });
    }

    /// A thread's remaining quantum.
    pub fn ticks_remaining(&self, thread: ThreadRef) -> u8 {
        critical_section::with(|_| unsafe { thread.tcb.as_ref().ticks_remaining })
    }

    /// Overwrites a thread's remaining quantum.
    pub fn set_ticks_remaining_for_test(&self, thread: ThreadRef, ticks: u8) {
        critical_section::with(|_| unsafe {
            (*thread.tcb.as_ptr()).ticks_remaining = ticks;
        });
    }

    /// A thread's waiting mask.
    pub fn waiting_signals(&self, thread: ThreadRef) -> SignalSet {
        critical_section::with(|_| unsafe { thread.tcb.as_ref().waiting_signals })
    }

    /// A thread's relative timeout offset.
    pub fn timeout_offset(&self, thread: ThreadRef) -> u32 {
        critical_section::with(|_| unsafe { thread.tcb.as_ref().timeout_offset })
    }

    /// A thread's stack bounds as `(base, one_past_top)`.
    pub fn stack_bounds(&self, thread: ThreadRef) -> (usize, usize) {
        critical_section::with(|_| {
            let tcb = unsafe { thread.tcb.as_ref() };
            (tcb.stack_base as usize, tcb.stack_top())
        })
    }

    /// Runs the end-of-life path for the installed current thread, as the
    /// trampoline would after its entry returned `exit_code`.
    pub fn retire_current_for_test(&self, exit_code: i16) {
        self.retire_current(exit_code);
    }
}

impl<A: Arch> Default for Kernel<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every thread starts and ends life here. The prepared stack frame
/// "returns into" this function on the thread's first restore; it runs
/// the entry, then cleans up and hands the CPU over.
extern "C" fn global_thread_entry() -> ! {
    let k = kernel();

    let entry = critical_section::with(|cs| {
        let s = k.sched(cs);
        let cur = s.current.expect("trampoline with no current thread");
        unsafe { cur.as_ref().entry }
    });

    let exit_code = match entry {
        Some(entry) => entry(),
        None => 0,
    };

    // Not to be disturbed while cleaning up. Never re-enabled on this
    // stack: the closing yield switches away for good.
    DefaultArch::disable_interrupts();
    k.retire_current(exit_code);

    unreachable!("retired thread resumed");
}

// ----------------------------------------------------------------------
// Replaceable hooks
// ----------------------------------------------------------------------

static IDLE_ENTRY: AtomicUsize = AtomicUsize::new(0);
static ON_THREAD_EXIT: AtomicUsize = AtomicUsize::new(0);
static ON_STACK_OVERFLOW: AtomicUsize = AtomicUsize::new(0);

fn default_idle_entry() -> i16 {
    // Always be busy or asleep; never wait.
    loop {
        DefaultArch::idle_wait();
    }
}

fn default_thread_exit(_thread: ThreadRef, _exit_code: i16) {}

fn default_stack_overflow(_thread: ThreadRef) {}

/// Replaces the idle thread's entry. Must be called before
/// [`Kernel::init`]; the replacement must never block in `wait`/`delay`.
pub fn set_idle_entry(entry: ThreadEntry) {
    IDLE_ENTRY.store(entry as usize, Ordering::Relaxed);
}

/// Replaces the thread-exit hook. Runs in the exiting thread's context
/// with interrupts disabled.
pub fn set_on_thread_exit(hook: fn(ThreadRef, i16)) {
    ON_THREAD_EXIT.store(hook as usize, Ordering::Relaxed);
}

/// Replaces the stack-overflow hook. Runs on a safe stack with interrupts
/// disabled; after it returns the scheduler proceeds, but the violating
/// thread's state is unreliable.
pub fn set_on_stack_overflow(hook: fn(ThreadRef)) {
    ON_STACK_OVERFLOW.store(hook as usize, Ordering::Relaxed);
}

fn idle_entry() -> ThreadEntry {
    match IDLE_ENTRY.load(Ordering::Relaxed) {
        0 => default_idle_entry,
        f => unsafe { core::mem::transmute::<usize, ThreadEntry>(f) },
    }
}

fn thread_exit_hook() -> fn(ThreadRef, i16) {
    match ON_THREAD_EXIT.load(Ordering::Relaxed) {
        0 => default_thread_exit,
        f => unsafe { core::mem::transmute::<usize, fn(ThreadRef, i16)>(f) },
    }
}

fn stack_overflow_hook() -> fn(ThreadRef) {
    match ON_STACK_OVERFLOW.load(Ordering::Relaxed) {
        0 => default_stack_overflow,
        f => unsafe { core::mem::transmute::<usize, fn(ThreadRef)>(f) },
    }
}
