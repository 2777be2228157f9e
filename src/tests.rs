//! End-to-end scenarios: dependency ordering, scheduler behavior, reductions,
//! commutative arbitration, taskwait, blocking, events and the throttle.

use crate::deps::region::DataRegion;
use crate::runtime::Builder;
use crate::test_utils::{EventLog, leaked_u64, small_runtime};
use crate::{AccessType, ReductionSpec};
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn chain_of_three_runs_in_order() {
    let rt = small_runtime(4);
    let (cell, region) = leaked_u64(0);
    let log = EventLog::new();

    let ptr = cell as *mut u64 as usize;
    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());

    rt.task("t1")
        .access(AccessType::Out, false, region)
        .body(move || {
            unsafe { *(ptr as *mut u64) = 10 };
            l1.record("t1");
        })
        .submit();
    rt.task("t2")
        .access(AccessType::InOut, false, region)
        .body(move || {
            unsafe { *(ptr as *mut u64) *= 2 };
            l2.record("t2");
        })
        .submit();
    rt.task("t3")
        .access(AccessType::In, false, region)
        .body(move || {
            let seen = unsafe { *(ptr as *const u64) };
            l3.record(format!("t3:{seen}"));
        })
        .submit();

    rt.wait_quiescent();
    log.assert_before("t1", "t2");
    log.assert_before("t2", "t3:20");
    assert_eq!(*cell, 20, "t3 observed the value written by t2");
}

#[test]
fn diamond_joins_both_branches() {
    let rt = small_runtime(4);
    let a = DataRegion::new(0x6000_0000, 64);
    let b = DataRegion::new(0x6000_1000, 64);
    let log = EventLog::new();

    let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
    rt.task("t1")
        .access(AccessType::Out, false, a)
        .access(AccessType::Out, false, b)
        .body(move || l1.record("t1"))
        .submit();
    rt.task("t2")
        .access(AccessType::InOut, false, a)
        .body(move || {
            std::thread::sleep(Duration::from_millis(5));
            l2.record("t2");
        })
        .submit();
    rt.task("t3")
        .access(AccessType::InOut, false, b)
        .body(move || l3.record("t3"))
        .submit();
    rt.task("t4")
        .access(AccessType::In, false, a)
        .access(AccessType::In, false, b)
        .body(move || l4.record("t4"))
        .submit();

    rt.wait_quiescent();
    log.assert_before("t1", "t2");
    log.assert_before("t1", "t3");
    log.assert_before("t2", "t4");
    log.assert_before("t3", "t4");
}

#[rstest]
#[case::narrow(2)]
#[case::wide(8)]
fn independent_tasks_all_finish_exactly_once(#[case] workers: usize) {
    let rt = small_runtime(workers);
    const N: usize = 64;

    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..N {
        let counters = counters.clone();
        rt.task("independent")
            .body(move || {
                counters[i].fetch_add(1, Ordering::Relaxed);
            })
            .submit();
    }

    rt.wait_quiescent();
    for (i, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(Ordering::Relaxed), 1, "task {i} ran once");
    }
}

#[test]
fn equal_priority_preserves_fifo_order() {
    let rt = small_runtime(1);
    let log = EventLog::new();
    let gate = Arc::new(AtomicBool::new(false));

    // Hold the single worker so the queue builds up in submission order.
    let held = gate.clone();
    rt.task("holder")
        .body(move || {
            while !held.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        })
        .submit();

    for name in ["a", "b", "c", "d"] {
        let log = log.clone();
        rt.task(name)
            .priority(3)
            .body(move || log.record(name))
            .submit();
    }
    gate.store(true, Ordering::Release);

    rt.wait_quiescent();
    assert_eq!(log.snapshot(), vec!["a", "b", "c", "d"]);
}

#[test]
fn higher_priority_runs_first() {
    let rt = small_runtime(1);
    let log = EventLog::new();
    let gate = Arc::new(AtomicBool::new(false));

    let held = gate.clone();
    rt.task("holder")
        .body(move || {
            while !held.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        })
        .submit();

    let (lo, hi) = (log.clone(), log.clone());
    rt.task("low").priority(1).body(move || lo.record("low")).submit();
    rt.task("high").priority(9).body(move || hi.record("high")).submit();
    gate.store(true, Ordering::Release);

    rt.wait_quiescent();
    log.assert_before("high", "low");
}

#[test]
fn reduction_combines_every_contribution() {
    let rt = small_runtime(4);
    let (cell, region) = leaked_u64(0);

    let spec = ReductionSpec {
        op_index: 1,
        initializer: |slot| slot.fill(0),
        combiner: |target, slot| {
            let sum = u64::from_le_bytes(target[..8].try_into().unwrap())
                + u64::from_le_bytes(slot[..8].try_into().unwrap());
            target[..8].copy_from_slice(&sum.to_le_bytes());
        },
    };

    const N: u64 = 100;
    for i in 1..=N {
        rt.task("reduce")
            .reduction(region, spec)
            .body(move || {
                crate::reduction_contribution(region, |slot| {
                    let v = u64::from_le_bytes(slot[..8].try_into().unwrap()) + i;
                    slot[..8].copy_from_slice(&v.to_le_bytes());
                })
                .expect("reduction slot available");
            })
            .submit();
    }

    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    let ptr = cell as *mut u64 as usize;
    rt.task("final")
        .access(AccessType::In, false, region)
        .body(move || {
            seen.store(unsafe { *(ptr as *const u64) } as usize, Ordering::Release);
        })
        .submit();

    rt.wait_quiescent();
    assert_eq!(
        observed.load(Ordering::Acquire) as u64,
        N * (N + 1) / 2,
        "the final task sees the combined sum exactly once"
    );
}

#[test]
fn commutative_tasks_never_overlap() {
    let rt = small_runtime(4);
    let region = DataRegion::new(0x6100_0000, 128);

    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let (inside, peak, runs) = (inside.clone(), peak.clone(), runs.clone());
        rt.task("commutative")
            .commutative(region)
            .body(move || {
                let now = inside.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);
                std::thread::sleep(Duration::from_millis(2));
                inside.fetch_sub(1, Ordering::AcqRel);
                runs.fetch_add(1, Ordering::AcqRel);
            })
            .submit();
    }

    rt.wait_quiescent();
    assert_eq!(runs.load(Ordering::Acquire), 10, "all ten executed");
    assert_eq!(
        peak.load(Ordering::Acquire),
        1,
        "never two holders of the same region at once"
    );
}

#[test]
fn overlapping_regions_fragment_and_order() {
    let rt = small_runtime(4);
    let base = 0x6200_0000;
    let log = EventLog::new();

    let whole = DataRegion::new(base, 100);
    let left = DataRegion::new(base, 50);
    let right = DataRegion::new(base + 50, 50);
    let middle = DataRegion::new(base + 25, 50);

    let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
    rt.task("writer")
        .access(AccessType::Out, false, whole)
        .body(move || l1.record("writer"))
        .submit();
    rt.task("left")
        .access(AccessType::In, false, left)
        .body(move || {
            std::thread::sleep(Duration::from_millis(3));
            l2.record("left");
        })
        .submit();
    rt.task("right")
        .access(AccessType::In, false, right)
        .body(move || l3.record("right"))
        .submit();
    rt.task("middle")
        .access(AccessType::Out, false, middle)
        .body(move || l4.record("middle"))
        .submit();

    rt.wait_quiescent();
    log.assert_before("writer", "left");
    log.assert_before("writer", "right");
    log.assert_before("left", "middle");
    log.assert_before("right", "middle");
}

#[test]
fn weak_accesses_do_not_gate_readiness() {
    let rt = small_runtime(2);
    let region = DataRegion::new(0x6300_0000, 64);
    let log = EventLog::new();

    let (slow, weak) = (log.clone(), log.clone());
    rt.task("slow-writer")
        .access(AccessType::Out, false, region)
        .body(move || {
            std::thread::sleep(Duration::from_millis(30));
            slow.record("slow-writer");
        })
        .submit();
    rt.task("weak-reader")
        .access(AccessType::In, true, region)
        .body(move || weak.record("weak-reader"))
        .submit();

    rt.wait_quiescent();
    log.assert_before("weak-reader", "slow-writer");
}

#[test]
fn taskwait_joins_children() {
    let rt = small_runtime(4);
    let log = EventLog::new();

    let parent_log = log.clone();
    rt.task("parent")
        .body(move || {
            for name in ["c1", "c2", "c3"] {
                let child_log = parent_log.clone();
                crate::task(name)
                    .body(move || {
                        std::thread::sleep(Duration::from_millis(2));
                        child_log.record(name);
                    })
                    .submit();
            }
            crate::taskwait();
            parent_log.record("after-wait");
        })
        .submit();

    rt.wait_quiescent();
    for child in ["c1", "c2", "c3"] {
        log.assert_before(child, "after-wait");
    }
}

#[test]
fn taskwait_orders_child_access_chains() {
    let rt = small_runtime(4);
    let region = DataRegion::new(0x6400_0000, 64);
    let log = EventLog::new();

    let parent_log = log.clone();
    rt.task("parent")
        .access(AccessType::InOut, true, region)
        .body(move || {
            let child_log = parent_log.clone();
            crate::task("child-writer")
                .access(AccessType::Out, false, region)
                .body(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    child_log.record("child-writer");
                })
                .submit();
            crate::taskwait();
            parent_log.record("after-wait");
        })
        .submit();

    rt.wait_quiescent();
    log.assert_before("child-writer", "after-wait");
}

#[test]
fn blocked_task_releases_its_worker() {
    let rt = small_runtime(1);
    let log = EventLog::new();

    let blocker_log = log.clone();
    let handle = rt
        .task("blocker")
        .body(move || {
            blocker_log.record("block-start");
            crate::block_current_task();
            blocker_log.record("block-end");
        })
        .submit();

    assert!(wait_until(Duration::from_secs(2), || {
        log.index_of("block-start").is_some()
    }));

    // The single worker is inside the blocked body; other work must still
    // run on it.
    let other_log = log.clone();
    rt.task("other").body(move || other_log.record("other")).submit();
    assert!(wait_until(Duration::from_secs(2), || {
        log.index_of("other").is_some()
    }));

    rt.unblock_task(&handle);
    rt.wait_quiescent();
    log.assert_before("block-start", "other");
    log.assert_before("other", "block-end");
}

#[test]
fn external_events_hold_successors() {
    let rt = small_runtime(2);
    let region = DataRegion::new(0x6500_0000, 64);
    let log = EventLog::new();

    let counter: Arc<parking_lot::Mutex<Option<crate::EventCounter>>> =
        Arc::new(parking_lot::Mutex::new(None));

    let stash = counter.clone();
    let producer_log = log.clone();
    rt.task("producer")
        .access(AccessType::Out, false, region)
        .body(move || {
            let events = crate::current_event_counter().expect("inside a task");
            events.increase(1);
            *stash.lock() = Some(events);
            producer_log.record("producer-body");
        })
        .submit();

    let consumer_log = log.clone();
    rt.task("consumer")
        .access(AccessType::In, false, region)
        .body(move || consumer_log.record("consumer"))
        .submit();

    assert!(wait_until(Duration::from_secs(2), || {
        log.index_of("producer-body").is_some()
    }));
    std::thread::sleep(Duration::from_millis(20));
    assert!(
        log.index_of("consumer").is_none(),
        "the pending event holds the successor"
    );

    let events = counter.lock().take().expect("event counter stashed");
    events.decrease(1);

    rt.wait_quiescent();
    log.assert_before("producer-body", "consumer");
}

#[test]
fn idle_workers_resume_on_enqueue() {
    let rt = small_runtime(2);

    assert!(
        wait_until(Duration::from_secs(2), || rt.inner.idle.idle_count() == 2),
        "both workers park when there is nothing to do"
    );

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    rt.task("wakeup")
        .body(move || flag.store(true, Ordering::Release))
        .submit();

    assert!(
        wait_until(Duration::from_secs(2), || done.load(Ordering::Acquire)),
        "an enqueue after idling is executed in bounded time"
    );
}

#[test]
fn throttle_still_makes_progress() {
    let rt = Builder::new()
        .worker_threads(2)
        .throttle(true, 4)
        .try_build()
        .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let outer_runs = runs.clone();
    rt.task("fan-out")
        .body(move || {
            for _ in 0..32 {
                let runs = outer_runs.clone();
                crate::task("nested")
                    .body(move || {
                        runs.fetch_add(1, Ordering::Relaxed);
                    })
                    .submit();
            }
        })
        .submit();

    rt.wait_quiescent();
    assert_eq!(runs.load(Ordering::Relaxed), 32);
}

#[test]
fn if0_tasks_run_before_submit_returns() {
    let rt = small_runtime(2);
    let log = EventLog::new();

    let outer = log.clone();
    rt.task("parent")
        .body(move || {
            let inline = outer.clone();
            crate::task("inline")
                .if0()
                .body(move || inline.record("inline"))
                .submit();
            outer.record("after-inline");
        })
        .submit();

    rt.wait_quiescent();
    log.assert_before("inline", "after-inline");
}

#[test]
fn spawned_functions_report_completion() {
    let rt = small_runtime(2);
    let log = EventLog::new();

    let (body_log, done_log) = (log.clone(), log.clone());
    rt.spawn_function(
        move || body_log.record("spawned-body"),
        Some(Box::new(move || done_log.record("spawned-done"))),
        "spawned",
    );

    rt.wait_quiescent();
    log.assert_before("spawned-body", "spawned-done");
}

#[test]
fn satisfiability_is_monotonic() {
    let rt = small_runtime(2);
    let region = DataRegion::new(0x6600_0000, 64);

    let first = rt
        .task("first")
        .access(AccessType::Out, false, region)
        .body(|| {})
        .submit();
    let second = rt
        .task("second")
        .access(AccessType::InOut, false, region)
        .body(|| {})
        .submit();

    rt.wait_quiescent();
    for handle in [&first, &second] {
        let inner = handle.0.accesses.lock();
        for (_, access) in inner.arena.iter() {
            assert!(access.read_satisfied());
            assert!(access.write_satisfied());
        }
    }
}
