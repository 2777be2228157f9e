use super::*;
use crate::task::TaskFlags;
use crate::test_utils::small_runtime;
use std::sync::atomic::Ordering;

#[test]
fn start_steps_cascade_through_the_dag() {
    let rt = small_runtime(1);

    let s1 = Step::new(StepWork::Start, 1);
    let s2 = Step::new(StepWork::Start, 1);
    let s3 = Step::new(StepWork::ClusterExecute, 1);
    s1.add_successor(s2.clone());
    s2.add_successor(s3.clone());

    s1.predecessor_done(&rt.inner);
    assert_eq!(s1.state(), StepState::Done);
    assert_eq!(s2.state(), StepState::Done);
    assert_eq!(
        s3.state(),
        StepState::Live,
        "cluster-execute waits for the remote completion"
    );

    s3.complete(&rt.inner);
    assert_eq!(s3.state(), StepState::Done);
}

#[test]
fn complete_releases_successors_exactly_once() {
    let rt = small_runtime(1);

    let step = Step::new(StepWork::ClusterExecute, 0);
    let successor = Step::new(StepWork::Start, 2);
    step.add_successor(successor.clone());

    step.complete(&rt.inner);
    step.complete(&rt.inner);

    assert_eq!(step.state(), StepState::Done);
    assert_eq!(
        successor.state(),
        StepState::Live,
        "one predecessor release, not two"
    );
    assert_eq!(successor.pending_predecessors.load(Ordering::Acquire), 1);
}

#[test]
fn offloaded_workflow_releases_on_remote_finish() {
    let rt = small_runtime(1);

    let task = rt
        .inner
        .create_task(None, None, TaskFlags::empty(), 0, None);
    let workflow = TaskWorkflow::new_offloaded(&task);
    *task.workflow.lock() = Some(workflow.clone());

    workflow.begin(&rt.inner);
    assert!(!task.has_finished(), "execute step still waiting");

    workflow.remote_finished(&rt.inner);
    assert!(task.has_finished());
    rt.wait_quiescent();
}
