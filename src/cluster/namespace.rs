use crate::cluster::offload;
use crate::runtime::RuntimeInner;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct NamespaceState {
    /// Remote wrappers spawned and not yet finished.
    pending: usize,
    /// SysFinish received: stop accepting work and wind down.
    draining: bool,
}

/// The per-node namespace service: a long-running thread that dequeues
/// cluster messages, spawns wrapper tasks for TaskNew, and applies
/// satisfiability updates. Shutdown joins on a condvar-guarded counter, so
/// nobody ever polls with a sleep loop waiting for it.
pub(crate) struct NodeNamespace {
    state: Mutex<NamespaceState>,
    drained: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NodeNamespace {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(NamespaceState {
                pending: 0,
                draining: false,
            }),
            drained: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the service thread. Called once the runtime is fully built.
    pub(crate) fn start(&self, runtime: Arc<RuntimeInner>) {
        let rank = runtime
            .cluster
            .as_ref()
            .map(|services| services.node_id)
            .unwrap_or(0);
        let handle = thread::Builder::new()
            .name(format!("taskweave-namespace-{rank}"))
            .spawn(move || namespace_loop(runtime))
            .expect("failed to spawn namespace thread");
        *self.thread.lock() = Some(handle);
    }

    pub(crate) fn wrapper_started(&self) {
        self.state.lock().pending += 1;
    }

    pub(crate) fn wrapper_finished(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending > 0, "wrapper countdown underflow");
        state.pending -= 1;
        if state.pending == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn mark_draining(&self) {
        self.state.lock().draining = true;
        self.drained.notify_all();
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Block until every in-flight wrapper finished, then join the thread.
    pub(crate) fn join(&self) {
        {
            let mut state = self.state.lock();
            while state.pending > 0 {
                self.drained.wait(&mut state);
            }
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn namespace_loop(runtime: Arc<RuntimeInner>) {
    let services = runtime
        .cluster
        .as_ref()
        .expect("namespace thread without cluster services")
        .clone();

    tracing::debug!(node = services.node_id, "node namespace up");
    loop {
        let mut worked = false;
        while let Some(message) = services.messenger.check_mail() {
            offload::handle_message(&runtime, &services, message);
            worked = true;
        }
        services.transfers.poll(services.messenger.as_ref());

        let stop = (runtime.is_shutting_down() || services.namespace.is_draining())
            && services.namespace.pending() == 0;
        if stop && !worked {
            break;
        }
        if !worked {
            thread::sleep(Duration::from_micros(200));
        }
    }
    tracing::debug!(node = services.node_id, "node namespace drained");
}
