use crate::runtime::RuntimeInner;
use crate::task::Task;
use std::cell::RefCell;
use std::sync::Arc;

/// Per-worker thread-local state: which runtime and CPU this thread serves,
/// and which task body is currently on its stack. External threads have
/// none of it; API paths fall back gracefully.
struct WorkerContext {
    runtime: Arc<RuntimeInner>,
    cpu: usize,
    current_task: Option<Arc<Task>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

pub(crate) fn install(runtime: Arc<RuntimeInner>, cpu: usize) {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(WorkerContext {
            runtime,
            cpu,
            current_task: None,
        });
    });
}

pub(crate) fn clear() {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = None;
    });
}

pub(crate) fn current_cpu() -> Option<usize> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|c| c.cpu))
}

pub(crate) fn current_runtime() -> Option<Arc<RuntimeInner>> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|c| c.runtime.clone()))
}

pub(crate) fn current_task() -> Option<Arc<Task>> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().and_then(|c| c.current_task.clone()))
}

/// Swap the task under execution; nested execution during cooperative waits
/// saves and restores the outer task through the return value.
pub(crate) fn swap_current_task(task: Option<Arc<Task>>) -> Option<Arc<Task>> {
    CONTEXT.with(|ctx| {
        let mut borrow = ctx.borrow_mut();
        match borrow.as_mut() {
            Some(c) => std::mem::replace(&mut c.current_task, task),
            None => None,
        }
    })
}
