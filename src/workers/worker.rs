use crate::runtime::{RuntimeInner, context};
use crate::task::Task;
use crate::workers::cpu::{Cpu, CpuState, pin_current_thread};
use std::sync::Arc;
use std::time::Duration;

/// The worker event loop: poll the scheduler, run tasks, and when nothing is
/// ready go through the idle-admission protocol before parking. Shutdown is
/// cooperative: the loop drains the scheduler to empty, then terminates.
pub(crate) fn worker_loop(runtime: Arc<RuntimeInner>, cpu: Arc<Cpu>) {
    context::install(runtime.clone(), cpu.id);
    pin_current_thread(cpu.os_id);
    cpu.set_state(CpuState::AcquiredRunning);
    tracing::trace!(cpu = cpu.id, "worker up");

    loop {
        debug_assert_eq!(cpu.state(), CpuState::AcquiredRunning);
        if let Some(task) = runtime.scheduler.get_ready_task(cpu.id) {
            runtime.execute_task(task, Some(cpu.id));
            continue;
        }

        if runtime.is_shutting_down() {
            break;
        }

        // Idle admission: the re-check under the idle lock prevents a lost
        // wake-up when a task lands between our empty poll and the mark.
        if !runtime
            .idle
            .cpu_becomes_idle(cpu.id, || runtime.scheduler.has_available_work(cpu.id))
        {
            continue;
        }

        cpu.park(|| runtime.is_shutting_down());
        cpu.set_state(CpuState::AcquiredRunning);
    }

    cpu.set_state(CpuState::ShuttingDown);
    context::clear();
    cpu.set_state(CpuState::Terminated);
    tracing::trace!(cpu = cpu.id, "worker down");
}

/// Cooperative wait used by taskwait, the blocking API, if0 inlining and
/// the throttle: keep the CPU useful by running other ready tasks until the
/// condition holds. Off a worker thread there is nothing to help with, so
/// the caller just parks in short slices.
pub(crate) fn cooperative_wait(
    runtime: &Arc<RuntimeInner>,
    park_on: Option<&Arc<Task>>,
    until: impl Fn() -> bool,
) {
    let cpu = context::current_cpu();
    loop {
        if until() {
            return;
        }
        let next = cpu.and_then(|id| runtime.scheduler.get_ready_task(id));
        match next {
            Some(task) => runtime.execute_task(task, cpu),
            None => match park_on {
                Some(task) => task.park_wait(Duration::from_micros(500)),
                None => std::thread::sleep(Duration::from_micros(100)),
            },
        }
    }
}

/// One task from creation to completion on this thread, restoring the
/// previous task around it so nested execution inside cooperative waits is
/// safe.
pub(crate) fn run_task_body(runtime: &Arc<RuntimeInner>, task: &Arc<Task>) {
    let previous = context::swap_current_task(Some(task.clone()));
    runtime.run_body(task);
    context::swap_current_task(previous);
}
