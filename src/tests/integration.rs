//! Kernel-level scenarios: scheduling, timeouts, stop/restart, the pool
//! and thread end-of-life, driven tick by tick through the recording
//! architecture.

use portable_atomic::{AtomicUsize, Ordering};

use super::helpers::*;
use crate::config::{
    IDLE_THREAD_STACK_BYTES, NUM_POOL_THREADS, PAGE_BYTES, POOL_THREAD_STACK_BYTES, QUANTUM_TICKS,
};
use crate::errors::{PoolError, SpawnError};
use crate::signal::SignalSet;
use crate::synapse::Synapse;
use crate::thread::{ThreadBuilder, ThreadFlags, ThreadStatus};
use crate::time::Duration;

mod boot {
    use super::*;

    #[test]
    fn init_builds_idle_and_pool() {
        let k = booted_kernel();

        let idle = k.idle_thread().expect("no idle thread");
        assert_eq!(idle.name(), Some("idle"));
        assert_eq!(k.pool_len(), NUM_POOL_THREADS);

        // idle is parked, not queued
        assert!(k.active_ids().is_empty());
        assert!(k.expired_ids().is_empty());

        let expected_pages = (IDLE_THREAD_STACK_BYTES
            + NUM_POOL_THREADS * POOL_THREAD_STACK_BYTES)
            / PAGE_BYTES;
        assert_eq!(k.pages_used(), expected_pages);
    }

    #[test]
    fn spawn_requires_init() {
        let k = fresh_kernel();
        let err = ThreadBuilder::new(nop_entry).spawn_on(k).unwrap_err();
        assert_eq!(err, SpawnError::NotInitialized);
    }

    #[test]
    fn spawn_reports_exhaustion() {
        let k = booted_kernel();
        let err = ThreadBuilder::new(nop_entry)
            .stack_bytes(crate::config::DYNAMIC_BYTES)
            .spawn_on(k)
            .unwrap_err();
        assert_eq!(err, SpawnError::OutOfMemory);
    }

    #[test]
    fn spawned_threads_join_the_active_list_with_unique_ids() {
        let k = booted_kernel();

        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let c = spawn_thread(k, "c");

        assert_eq!(k.active_ids(), [a.id(), b.id(), c.id()]);
        assert!(a.id() != b.id() && b.id() != c.id() && a.id() != c.id());
    }

    #[test]
    fn unready_threads_stay_parked() {
        let k = booted_kernel();

        let t = ThreadBuilder::new(nop_entry)
            .flags(ThreadFlags::SELF_DESTRUCT)
            .spawn_on(k)
            .unwrap();

        assert!(k.active_ids().is_empty());
        assert_eq!(k.status(t), ThreadStatus::Ready);
    }
}

mod scheduling {
    use super::*;

    #[test]
    fn selection_swaps_lists_and_falls_back_to_idle() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let user = a.allocate_signal(None);

        k.set_current_for_test(Some(a));
        k.wait_on(a, user, None); // blocks: active drains, lists swap

        assert_eq!(k.current(), k.idle_thread());

        // a new thread lands on whichever list is now active
        let b = spawn_thread(k, "b");
        assert_eq!(k.select_next_for_test(), b);
    }

    #[test]
    fn preemption_rotates_through_the_quantum() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        k.set_current_for_test(Some(a));

        // a arrives with an exhausted quantum: first tick moves it out
        k.tick_preempt();
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.active_ids(), [b.id()]);
        assert_eq!(k.expired_ids(), [a.id()]);
        assert_eq!(k.ticks_remaining(b), QUANTUM_TICKS);

        // b runs its full quantum...
        for _ in 0..QUANTUM_TICKS - 1 {
            k.tick_preempt();
            assert_eq!(k.current(), Some(b));
        }

        // ...then the lists swap and a comes back topped up, with both
        // threads now on the fresh active list
        k.tick_preempt();
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.ticks_remaining(a), QUANTUM_TICKS);
        assert_eq!(k.active_ids(), [a.id(), b.id()]);
        assert!(k.expired_ids().is_empty());
    }

    #[test]
    fn displaced_current_loses_its_quantum() {
        let k = booted_kernel();
        let waiter = spawn_thread(k, "waiter");
        let user = waiter.allocate_signal(None);

        k.set_current_for_test(Some(waiter));
        k.wait_on(waiter, user, None); // blocks

        let runner = k.current().expect("no current");
        k.set_ticks_remaining_for_test(runner, QUANTUM_TICKS);

        // waking the waiter prepends it: the runner is no longer at the
        // head, so its remaining quantum is forfeit
        k.signal(waiter, user);
        assert_eq!(k.active_ids().first(), Some(&waiter.id()));

        k.tick_preempt();
        assert_eq!(k.current(), Some(waiter));
    }

    #[test]
    fn forbid_defers_preemption_but_not_time() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let _ = b;
        k.set_current_for_test(Some(a));

        k.forbid();
        let before = k.now();
        for _ in 0..3 {
            k.tick_time();
            k.tick_preempt();
        }
        // the clock advanced, the current thread did not change
        assert_eq!(k.now(), before + 3);
        assert_eq!(k.current(), Some(a));

        k.permit();
        k.tick_preempt();
        assert_ne!(k.current(), Some(a));
    }

    #[test]
    fn idle_is_never_queued() {
        let k = booted_kernel();
        let idle = k.idle_thread().unwrap();
        k.set_current_for_test(Some(idle));

        for _ in 0..3 {
            k.tick_preempt();
        }

        assert_eq!(k.current(), Some(idle));
        assert!(k.active_ids().is_empty());
        assert!(k.expired_ids().is_empty());
    }

    #[test]
    fn yield_now_rotates_to_the_next_ready_thread() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        k.set_current_for_test(Some(a));

        k.yield_now();
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.expired_ids(), [a.id()]);
    }
}

mod timeouts {
    use super::*;

    #[test]
    fn delay_parks_on_the_timeout_list_and_the_tick_wakes_it() {
        let k = booted_kernel();
        let t = spawn_thread(k, "sleeper");

        k.set_current_for_test(Some(t));
        k.wait_on(t, SignalSet::EMPTY, Some(Duration::from_millis(10)));

        assert_eq!(k.sleeper_offsets(), [(t.id(), 10)]);
        assert_ne!(k.current(), Some(t));

        for _ in 0..9 {
            k.tick_time();
        }
        assert_eq!(k.sleeper_offsets(), [(t.id(), 1)]);

        k.tick_time();
        // elapsed time at wake is at least the requested delay
        assert!(k.now() >= 10);
        assert!(k.sleeper_offsets().is_empty());
        assert_eq!(k.active_ids().first(), Some(&t.id()));
        assert!(t.current_signals().contains(SignalSet::TIMEOUT));
    }

    #[test]
    fn staggered_sleepers_expire_in_order() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let c = spawn_thread(k, "c");

        for (t, ms) in [(a, 5), (b, 12), (c, 30)] {
            k.set_current_for_test(Some(t));
            k.wait_on(t, SignalSet::EMPTY, Some(Duration::from_millis(ms)));
        }

        // deltas, not absolutes
        assert_eq!(
            k.sleeper_offsets(),
            [(a.id(), 5), (b.id(), 7), (c.id(), 18)]
        );

        for _ in 0..5 {
            k.tick_time();
        }
        assert_eq!(k.sleeper_offsets(), [(b.id(), 7), (c.id(), 18)]);

        for _ in 0..7 {
            k.tick_time();
        }
        assert_eq!(k.sleeper_offsets(), [(c.id(), 18)]);

        for _ in 0..18 {
            k.tick_time();
        }
        assert!(k.sleeper_offsets().is_empty());
        assert_eq!(k.now(), 30);
    }

    #[test]
    fn signal_beats_the_timeout() {
        let k = booted_kernel();
        let t = spawn_thread(k, "t");
        let user = t.allocate_signal(None);

        k.set_current_for_test(Some(t));
        k.wait_on(t, user, Some(Duration::from_millis(10)));

        for _ in 0..9 {
            k.tick_time();
        }
        k.signal(t, user);
        k.tick_time(); // the would-be expiry tick

        // woken by the signal: off the timeout list, timeout disarmed
        assert!(k.sleeper_offsets().is_empty());
        assert_eq!(k.timeout_offset(t), 0);

        k.set_current_for_test(Some(t));
        let fired = k.wait_on(t, user, Some(Duration::from_millis(1)));
        assert_eq!(fired, user);
        assert!(!t.current_signals().intersects(user));
    }

    #[test]
    fn timeout_beats_the_signal() {
        let k = booted_kernel();
        let t = spawn_thread(k, "t");
        let user = t.allocate_signal(None);

        k.set_current_for_test(Some(t));
        k.wait_on(t, user, Some(Duration::from_millis(10)));

        for _ in 0..10 {
            k.tick_time();
        }
        k.signal(t, user); // arrives just after expiry: latched

        k.set_current_for_test(Some(t));
        let fired = k.wait_on(t, user, Some(Duration::from_millis(1)));
        assert_eq!(fired, user | SignalSet::TIMEOUT);
        assert!(!t.current_signals().intersects(user));
    }
}

mod signals {
    use super::*;

    #[test]
    fn signal_hoists_a_blocked_thread_to_the_head() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let user = a.allocate_signal(None);

        k.set_current_for_test(Some(a));
        k.wait_on(a, user, None); // blocks; b runs

        assert_eq!(k.current(), Some(b));

        k.signal(a, user);
        // woken ahead of everyone already queued
        assert_eq!(k.active_ids().first(), Some(&a.id()));
    }

    #[test]
    fn signalling_a_ready_thread_just_latches() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let user = b.allocate_signal(None);

        k.set_current_for_test(Some(a));
        // b is ready (not waiting): nothing to wake, nothing to hoist
        k.signal(b, user);

        assert_eq!(k.active_ids(), [a.id(), b.id()]);
        assert!(b.current_signals().contains(user));
    }

    #[test]
    fn stop_parks_and_restart_delivers_latched_signals() {
        let k = booted_kernel();
        let t = spawn_thread(k, "t");
        let user = t.allocate_signal(None);

        // t waits for user work and is stopped meanwhile
        k.set_current_for_test(Some(t));
        k.wait_on(t, user, None);
        assert_eq!(k.status(t), ThreadStatus::Waiting);

        k.stop(t);
        // the stop wakes the wait; model the resumption, which re-parks
        // the thread on START
        k.set_current_for_test(Some(t));
        let fired = k.wait_on(t, user, None);
        assert!(fired.contains(SignalSet::STOP));
        assert_eq!(k.status(t), ThreadStatus::Stopped);

        // work arriving while stopped is latched, not delivered
        k.signal(t, user);
        assert_ne!(k.active_ids().first(), Some(&t.id()));
        assert!(t.current_signals().contains(user));

        // restart releases the thread; the latched signal is still there
        k.restart(t);
        assert_eq!(k.active_ids().first(), Some(&t.id()));

        k.set_current_for_test(Some(t));
        let fired = k.wait_on(t, user, None);
        assert_eq!(fired, user);
    }

    #[test]
    fn stop_is_a_no_op_for_a_thread_not_listening() {
        let k = booted_kernel();
        let t = spawn_thread(k, "t");

        // t is ready, not waiting: no STOP in its waiting mask
        k.stop(t);
        assert!(t.current_signals().is_empty());
        assert_eq!(k.status(t), ThreadStatus::Ready);
    }
}

mod pool {
    use super::*;

    #[test]
    fn jobs_jump_the_queue_and_recycle() {
        let k = booted_kernel();
        let bystander = spawn_thread(k, "bystander");

        let job = k.from_pool(Some("job"), nop_entry).expect("pool empty");
        assert_eq!(k.pool_len(), NUM_POOL_THREADS - 1);
        assert_eq!(k.active_ids().first(), Some(&job.id()));
        assert_ne!(job.id(), bystander.id());

        k.set_current_for_test(Some(job));
        k.retire_current_for_test(0);

        assert_eq!(k.pool_len(), NUM_POOL_THREADS);
        assert!(!k.active_ids().contains(&job.id()));
    }

    #[test]
    fn empty_pool_is_an_error() {
        let k = booted_kernel();

        for _ in 0..NUM_POOL_THREADS {
            k.from_pool(None, nop_entry).expect("pool empty early");
        }
        assert_eq!(k.from_pool(None, nop_entry), Err(PoolError::Empty));
    }

    #[test]
    fn a_hundred_jobs_leak_nothing() {
        let k = booted_kernel();
        let pages_before = k.pages_used();

        for i in 0..100 {
            let job = k.from_pool(Some("job"), nop_entry).expect("pool empty");
            k.set_current_for_test(Some(job));
            k.retire_current_for_test(i);
        }

        assert_eq!(k.pool_len(), NUM_POOL_THREADS);
        assert_eq!(k.pages_used(), pages_before);
    }

    #[test]
    fn termination_synapse_and_exit_code_are_delivered() {
        let k = booted_kernel();
        let parent = spawn_thread(k, "parent");
        let done = parent.allocate_signal(None);
        let syn = Synapse::from_parts(parent, done);

        k.set_current_for_test(Some(parent));
        k.wait_on(parent, done, None); // parent blocks on completion

        let mut exit_code: i16 = -1;
        let job = unsafe {
            k.from_pool_notify(Some("job"), nop_entry, Some(&syn), Some(&mut exit_code))
        }
        .expect("pool empty");

        k.set_current_for_test(Some(job));
        k.retire_current_for_test(42);

        assert_eq!(exit_code, 42);
        // the parent was woken by the synapse
        assert_eq!(k.active_ids().first(), Some(&parent.id()));
        assert!(parent.current_signals().contains(done));
    }

    #[test]
    fn dormant_shells_ignore_signals() {
        let k = booted_kernel();
        let shell = ThreadBuilder::new(nop_entry)
            .flags(ThreadFlags::POOL)
            .spawn_on(k)
            .unwrap();
        let pool_before = k.pool_len();

        k.signal(shell, SignalSet::STOP);

        assert_eq!(k.pool_len(), pool_before);
        assert!(!k.active_ids().contains(&shell.id()));
    }
}

mod end_of_life {
    use super::*;

    #[test]
    fn self_destruct_returns_the_stack_pages() {
        let k = booted_kernel();
        let pages_before = k.pages_used();

        let t = spawn_thread(k, "ephemeral");
        assert!(k.pages_used() > pages_before);

        k.set_current_for_test(Some(t));
        k.retire_current_for_test(0);

        assert_eq!(k.pages_used(), pages_before);
    }

    #[test]
    fn kept_descriptors_report_terminated() {
        let k = booted_kernel();

        let t = ThreadBuilder::new(nop_entry)
            .flags(ThreadFlags::READY)
            .spawn_on(k)
            .unwrap();

        k.set_current_for_test(Some(t));
        k.retire_current_for_test(3);

        assert_eq!(k.status(t), ThreadStatus::Terminated);
        assert!(!k.active_ids().contains(&t.id()));
    }

    #[test]
    fn exit_runs_the_replaceable_hook() {
        static EXITS: AtomicUsize = AtomicUsize::new(0);
        // the hook is process-global and other tests retire threads too,
        // so count only this test's thread
        fn count_exit(t: crate::thread::ThreadRef, code: i16) {
            if t.name() == Some("exit-hook-probe") && code == 7 {
                EXITS.fetch_add(1, Ordering::Relaxed);
            }
        }

        crate::kernel::set_on_thread_exit(count_exit);
        let k = booted_kernel();
        let t = spawn_thread(k, "exit-hook-probe");

        k.set_current_for_test(Some(t));
        k.retire_current_for_test(7);

        assert_eq!(EXITS.load(Ordering::Relaxed), 1);
    }
}

mod overflow {
    use super::*;

    #[test]
    fn overflow_fires_the_hook_once_per_breach_and_the_kernel_carries_on() {
        static BREACHES: AtomicUsize = AtomicUsize::new(0);
        fn count_breach(_t: crate::thread::ThreadRef) {
            BREACHES.fetch_add(1, Ordering::Relaxed);
        }

        crate::kernel::set_on_stack_overflow(count_breach);
        let k = booted_kernel();
        let t = spawn_thread(k, "reckless");
        let other = spawn_thread(k, "other");

        let (base, top) = k.stack_bounds(t);
        k.set_current_for_test(Some(t));
        k.set_saved_sp_for_test(t, base - 2);

        k.yield_now();
        assert_eq!(BREACHES.load(Ordering::Relaxed), 1);
        // other threads keep getting scheduled
        assert_eq!(k.current(), Some(other));

        // back within bounds: no further reports
        k.set_saved_sp_for_test(t, top - 8);
        k.set_current_for_test(Some(t));
        k.yield_now();
        assert_eq!(BREACHES.load(Ordering::Relaxed), 1);
    }
}

mod alternation {
    use super::*;

    /// Two threads each "toggle" and sleep 10 ms, for a simulated second.
    /// Their progress must be equal and close to the ideal cadence.
    #[test]
    fn two_sleepers_share_time_evenly() {
        let k = booted_kernel();
        let a = spawn_thread(k, "a");
        let b = spawn_thread(k, "b");
        let mut toggles = [0u32, 0];

        k.select_next_for_test();
        for _ in 0..1000 {
            loop {
                let cur = k.current().expect("no current thread");
                let idx = if cur == a {
                    0
                } else if cur == b {
                    1
                } else {
                    break;
                };

                let fired = k.wait_on(cur, SignalSet::EMPTY, Some(Duration::from_millis(10)));
                if fired.contains(SignalSet::TIMEOUT) {
                    toggles[idx] += 1;
                }
            }
            k.tick_time();
            k.tick_preempt();
        }

        assert_eq!(toggles[0], toggles[1]);
        assert!(
            (90..=105).contains(&toggles[0]),
            "unexpected cadence: {:?}",
            toggles
        );
    }
}
