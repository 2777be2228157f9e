//! Engine-level tests: fragmentation coverage, chain linking and the
//! commutative scoreboard, observed through real task submissions.

use crate::deps::access::{AccessType, DataAccess};
use crate::deps::commutative::CommutativeScoreboard;
use crate::deps::region::DataRegion;
use crate::task::{Task, TaskFlags, TaskId};
use crate::test_utils::small_runtime;
use std::sync::Arc;
use std::time::Duration;

fn fragment_regions(task: &Arc<Task>) -> Vec<DataRegion> {
    let inner = task.accesses.lock();
    let mut regions: Vec<DataRegion> = inner.arena.iter().map(|(_, a)| a.region()).collect();
    regions.sort();
    regions
}

#[test]
fn registration_fragments_cover_the_declared_region() {
    let rt = small_runtime(2);
    let base = 0x7000_0000;

    rt.task("first")
        .access(AccessType::Out, false, DataRegion::new(base, 50))
        .body(|| std::thread::sleep(Duration::from_millis(5)))
        .submit();
    // Overlaps the first by half: one fragment chains behind it, one starts
    // fresh.
    let second = rt
        .task("second")
        .access(AccessType::In, false, DataRegion::new(base + 25, 50))
        .body(|| {})
        .submit();

    rt.wait_quiescent();

    let fragments = fragment_regions(&second.0);
    assert_eq!(
        fragments,
        vec![
            DataRegion::new(base + 25, 25),
            DataRegion::new(base + 50, 25),
        ],
        "fragments are disjoint and cover exactly the declared region"
    );

    let covered: usize = fragments.iter().map(|r| r.len()).sum();
    assert_eq!(covered, 50, "no byte dropped by fragmentation");
}

#[test]
fn nested_overlap_fragments_three_ways() {
    let rt = small_runtime(2);
    let base = 0x7100_0000;

    rt.task("left")
        .access(AccessType::Out, false, DataRegion::new(base, 40))
        .body(|| std::thread::sleep(Duration::from_millis(5)))
        .submit();
    rt.task("right")
        .access(AccessType::Out, false, DataRegion::new(base + 60, 40))
        .body(|| std::thread::sleep(Duration::from_millis(5)))
        .submit();
    // Spans the gap and both neighbors.
    let spanning = rt
        .task("spanning")
        .access(AccessType::InOut, false, DataRegion::new(base, 100))
        .body(|| {})
        .submit();

    rt.wait_quiescent();

    let fragments = fragment_regions(&spanning.0);
    assert_eq!(
        fragments,
        vec![
            DataRegion::new(base, 40),
            DataRegion::new(base + 40, 20),
            DataRegion::new(base + 60, 40),
        ]
    );
}

#[test]
fn scoreboard_grants_in_fifo_order() {
    let board = CommutativeScoreboard::new();
    let region = DataRegion::new(0x100, 64);
    let task = Task::new(TaskId(99), None, None, TaskFlags::empty(), None, 0);

    let a = Arc::new(DataAccess::new(
        AccessType::Commutative,
        region,
        &task,
        false,
        false,
    ));
    let b = Arc::new(DataAccess::new(
        AccessType::Commutative,
        region,
        &task,
        false,
        false,
    ));
    let c = Arc::new(DataAccess::new(
        AccessType::Commutative,
        region,
        &task,
        false,
        false,
    ));

    assert!(board.try_acquire(region, a.clone()));
    assert!(!board.try_acquire(region, b.clone()));
    assert!(!board.try_acquire(region, c.clone()));
    assert_eq!(board.held_regions(), 1);

    // Release grants exactly one waiter, in arrival order.
    let granted = board.release_all([region]);
    assert_eq!(granted.len(), 1);
    assert!(Arc::ptr_eq(&granted[0], &b));

    let granted = board.release_all([region]);
    assert_eq!(granted.len(), 1);
    assert!(Arc::ptr_eq(&granted[0], &c));

    let granted = board.release_all([region]);
    assert!(granted.is_empty());
    assert_eq!(board.held_regions(), 0);
}

#[test]
fn disjoint_regions_do_not_contend_on_the_scoreboard() {
    let board = CommutativeScoreboard::new();
    let task = Task::new(TaskId(7), None, None, TaskFlags::empty(), None, 0);

    let left = DataRegion::new(0x100, 64);
    let right = DataRegion::new(0x200, 64);
    let a = Arc::new(DataAccess::new(AccessType::Commutative, left, &task, false, false));
    let b = Arc::new(DataAccess::new(AccessType::Commutative, right, &task, false, false));

    assert!(board.try_acquire(left, a));
    assert!(board.try_acquire(right, b));
    assert_eq!(board.held_regions(), 2);
}
