use crate::runtime::RuntimeInner;
use crate::workers::cpu::CpuState;
use crate::workers::worker::worker_loop;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

/// One kernel thread per enabled CPU. Spawn waits on a barrier so the
/// runtime only returns from init with every worker up.
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn spawn(runtime: &Arc<RuntimeInner>) -> Self {
        let cpus = runtime.idle.cpus().to_vec();
        let barrier = Arc::new(Barrier::new(cpus.len() + 1));

        let handles = cpus
            .into_iter()
            .map(|cpu| {
                cpu.set_state(CpuState::Enabled);
                let runtime = runtime.clone();
                let barrier = barrier.clone();
                let mut builder = thread::Builder::new().name(format!(
                    "{}-worker-{}",
                    runtime.cfg.thread_name_prefix, cpu.id
                ));
                if let Some(stack_size) = runtime.cfg.thread_stack_size {
                    builder = builder.stack_size(stack_size);
                }
                builder
                    .spawn(move || {
                        barrier.wait();
                        worker_loop(runtime, cpu);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        barrier.wait();
        Self {
            handles: Mutex::new(handles),
        }
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        let panicked = handles.drain(..).filter_map(|h| h.join().err()).count();
        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}
