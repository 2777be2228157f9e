use crate::cluster::ClusterServices;
use crate::cluster::dsm::Dsm;
use crate::cluster::message::Message;
use crate::cluster::messenger::Messenger;
use crate::cluster::offload;
use crate::deps::access::AccessType;
use crate::deps::batch::CpuDependencyData;
use crate::deps::registration::DependencyEngine;
use crate::deps::region::DataRegion;
use crate::error::fatal;
use crate::numa::{FlatTopology, MemoryPlace, NumaDirectory, Topology};
use crate::scheduler::cluster::ClusterPolicy;
use crate::scheduler::{ReadyTaskHint, SyncScheduler};
use crate::system::throttle::Throttle;
use crate::system::wisdom::Wisdom;
use crate::task::{Task, TaskBody, TaskFlags, TaskId, TaskTypeInfo};
use crate::workers::cpu::Cpu;
use crate::workers::idle::IdleCpus;
use crate::workers::pool::ThreadPool;
use crate::workers::worker::{cooperative_wait, run_task_body};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

pub(crate) mod context;

/// Tasks the throttle runs inline per engaged creation.
const THROTTLE_MAX_INLINE_RUNS: usize = 8;

/// Cluster collaborators handed to the builder.
pub struct ClusterSetup {
    pub messenger: Arc<dyn Messenger>,
    pub dsm: Arc<dyn Dsm>,
    pub policy: ClusterPolicy,
}

/// Runtime configuration builder. Everything has a sensible default; the
/// returned [`Runtime`](crate::Runtime) is ready to accept tasks.
pub struct Builder {
    worker_threads: Option<usize>,
    enable_priority: bool,
    enable_immediate_successor: bool,
    priority_from_cost: bool,
    throttle_enabled: bool,
    throttle_pressure: usize,
    wisdom_path: Option<PathBuf>,
    thread_name_prefix: String,
    thread_stack_size: Option<usize>,
    topology: Option<Arc<dyn Topology>>,
    cluster: Option<ClusterSetup>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            enable_priority: true,
            enable_immediate_successor: true,
            priority_from_cost: false,
            throttle_enabled: false,
            throttle_pressure: 10_000,
            wisdom_path: None,
            thread_name_prefix: "taskweave".into(),
            thread_stack_size: None,
            topology: None,
            cluster: None,
        }
    }

    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    pub fn enable_priority(mut self, val: bool) -> Self {
        self.enable_priority = val;
        self
    }

    pub fn enable_immediate_successor(mut self, val: bool) -> Self {
        self.enable_immediate_successor = val;
        self
    }

    /// Seed priorities from the wisdom file's predicted costs.
    pub fn priority_from_cost(mut self, val: bool) -> Self {
        self.priority_from_cost = val;
        self
    }

    pub fn throttle(mut self, enabled: bool, pressure: usize) -> Self {
        self.throttle_enabled = enabled;
        self.throttle_pressure = pressure;
        self
    }

    pub fn wisdom_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.wisdom_path = Some(path.into());
        self
    }

    pub fn thread_name_prefix(mut self, val: impl Into<String>) -> Self {
        self.thread_name_prefix = val.into();
        self
    }

    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn cluster(mut self, setup: ClusterSetup) -> Self {
        self.cluster = Some(setup);
        self
    }

    pub fn try_build(self) -> Result<crate::Runtime> {
        let topology = self
            .topology
            .unwrap_or_else(|| Arc::new(FlatTopology::detect()));
        let available = topology.cpus().len();
        let worker_threads = self.worker_threads.unwrap_or(available).min(available);
        if worker_threads == 0 {
            return Err(anyhow!("topology reported no usable CPUs"));
        }

        let cfg = RuntimeConfig {
            worker_threads,
            enable_priority: self.enable_priority,
            enable_immediate_successor: self.enable_immediate_successor,
            priority_from_cost: self.priority_from_cost,
            thread_name_prefix: self.thread_name_prefix,
            thread_stack_size: self.thread_stack_size,
        };

        let cpus: Vec<Arc<Cpu>> = topology.cpus()[..cfg.worker_threads]
            .iter()
            .enumerate()
            .map(|(index, d)| Arc::new(Cpu::new(index, d.id, d.numa_node)))
            .collect();
        let idle = Arc::new(IdleCpus::new(cpus, topology.numa_node_count()));
        let scheduler = SyncScheduler::new(
            worker_threads,
            cfg.enable_priority,
            cfg.enable_immediate_successor,
            idle.clone(),
        );

        let rank = self
            .cluster
            .as_ref()
            .map(|c| c.messenger.rank())
            .unwrap_or(0);
        let next_task_id = AtomicU64::new(1);
        let namespace_scope_id = TaskId(next_task_id.fetch_add(1, Ordering::Relaxed));

        let cluster = self.cluster.map(|setup| {
            ClusterServices::new(setup.messenger, setup.dsm, setup.policy, namespace_scope_id)
        });

        let inner = Arc::new(RuntimeInner {
            cfg,
            topology,
            scheduler,
            idle,
            engine: DependencyEngine::new(rank),
            directory: NumaDirectory::new(),
            throttle: Throttle::new(self.throttle_enabled, self.throttle_pressure),
            wisdom: Wisdom::load(self.wisdom_path)?,
            task_types: DashMap::new(),
            next_task_id,
            live_tasks: AtomicUsize::new(0),
            quiesce: Mutex::new(()),
            quiescent: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_done: AtomicBool::new(false),
            cluster,
            main_task: OnceLock::new(),
            pool: OnceLock::new(),
        });

        let main = Task::new(
            TaskId(0),
            Some("main".into()),
            None,
            TaskFlags::MAIN,
            None,
            0,
        );
        inner.main_task.set(main).ok();

        inner
            .pool
            .set(ThreadPool::spawn(&inner))
            .map_err(|_| anyhow!("thread pool initialized twice"))?;
        if let Some(services) = &inner.cluster {
            services.namespace.start(inner.clone());
        }

        Ok(crate::Runtime { inner })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) enable_priority: bool,
    pub(crate) enable_immediate_successor: bool,
    pub(crate) priority_from_cost: bool,
    pub(crate) thread_name_prefix: String,
    pub(crate) thread_stack_size: Option<usize>,
}

/// The runtime context: every subsystem hangs off this handle; there are no
/// process-wide singletons. Workers reach it through the thread-local
/// context installed at worker start.
pub(crate) struct RuntimeInner {
    pub(crate) cfg: RuntimeConfig,
    #[allow(dead_code)]
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) scheduler: SyncScheduler,
    pub(crate) idle: Arc<IdleCpus>,
    pub(crate) engine: DependencyEngine,
    pub(crate) directory: NumaDirectory,
    pub(crate) throttle: Throttle,
    pub(crate) wisdom: Wisdom,
    pub(crate) task_types: DashMap<String, Arc<TaskTypeInfo>>,
    next_task_id: AtomicU64,
    live_tasks: AtomicUsize,
    quiesce: Mutex<()>,
    quiescent: Condvar,
    shutting_down: AtomicBool,
    shutdown_done: AtomicBool,
    pub(crate) cluster: Option<Arc<ClusterServices>>,
    main_task: OnceLock<Arc<Task>>,
    pool: OnceLock<ThreadPool>,
}

impl RuntimeInner {
    pub(crate) fn next_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn main_task(&self) -> &Arc<Task> {
        self.main_task.get().expect("runtime fully built")
    }

    pub(crate) fn live_task_created(&self) {
        self.live_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn live_task_disposed(&self) {
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.quiesce.lock();
            self.quiescent.notify_all();
        }
    }

    pub(crate) fn live_task_count(&self) -> usize {
        self.live_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn wait_quiescent(self: &Arc<Self>) {
        if context::current_cpu().is_some() {
            // A worker helps instead of sleeping.
            cooperative_wait(self, None, || self.live_task_count() == 0);
            return;
        }
        let mut guard = self.quiesce.lock();
        while self.live_task_count() > 0 {
            self.quiescent
                .wait_for(&mut guard, std::time::Duration::from_millis(1));
        }
    }

    // --- creation and submission ---

    pub(crate) fn create_task(
        self: &Arc<Self>,
        label: Option<String>,
        body: Option<TaskBody>,
        flags: TaskFlags,
        priority: i64,
        parent: Option<Arc<Task>>,
    ) -> Arc<Task> {
        // Back-pressure: run ready work before growing the graph further.
        if self.throttle.is_active()
            && let Some(cpu) = context::current_cpu()
        {
            let mut budget = THROTTLE_MAX_INLINE_RUNS;
            while budget > 0 && self.throttle.should_engage(self.live_task_count()) {
                match self.scheduler.get_ready_task(cpu) {
                    Some(task) => self.execute_task(task, Some(cpu)),
                    None => break,
                }
                budget -= 1;
            }
        }

        let parent = parent
            .or_else(context::current_task)
            .unwrap_or_else(|| self.main_task().clone());

        let task = Task::new(
            self.next_id(),
            label,
            body,
            flags,
            Some(parent.clone()),
            priority,
        );
        parent.child_created();
        self.live_task_created();
        task
    }

    pub(crate) fn submit_task(self: &Arc<Self>, task: &Arc<Task>) {
        let mut batch = CpuDependencyData::new();
        self.engine.register_task_accesses(task, &mut batch);
        self.engine.process_delayed(&mut batch);
        self.drain_batch(&mut batch, context::current_cpu());
    }

    // --- readiness and dispatch ---

    /// Drain the batched side effects of a dependency walk: post satisfied
    /// originators to the scheduler, dispose removable tasks, and follow any
    /// cascade the disposals trigger. Runs with no dependency lock held.
    pub(crate) fn drain_batch(self: &Arc<Self>, batch: &mut CpuDependencyData, cpu: Option<usize>) {
        loop {
            let satisfied = std::mem::take(&mut batch.satisfied_originators);
            let removable = std::mem::take(&mut batch.removable_tasks);
            if satisfied.is_empty() && removable.is_empty() {
                debug_assert!(batch.is_drained());
                return;
            }

            // A single newly ready successor stays on the completing CPU.
            if satisfied.len() == 1 && cpu.is_some() {
                for task in satisfied {
                    self.post_ready(task, cpu, ReadyTaskHint::ImmediateSuccessor);
                }
            } else if self.cluster.is_none() {
                // No per-task routing decisions to make: one lock, one pass.
                self.scheduler
                    .add_ready_tasks(satisfied, cpu, ReadyTaskHint::None);
            } else {
                for task in satisfied {
                    self.post_ready(task, cpu, ReadyTaskHint::None);
                }
            }
            for task in removable {
                self.dispose_task(task, batch);
            }
            self.engine.process_delayed(batch);
        }
    }

    /// A task's dependencies are satisfied: offload it, gate it on data
    /// fetches, or hand it to the scheduler.
    pub(crate) fn post_ready(
        self: &Arc<Self>,
        task: Arc<Task>,
        cpu_hint: Option<usize>,
        hint: ReadyTaskHint,
    ) {
        if let Some(services) = &self.cluster {
            if let Some(target) = services.policy.pick_target(
                &task,
                services.dsm.as_ref(),
                &self.directory,
                services.cluster_size,
                services.node_id,
            ) {
                offload::offload_task(self, services, &task, target);
                return;
            }
            if task.is_remote() && self.fetch_remote_data(services.clone(), &task) {
                return; // enqueued by the last fetch completion
            }
        }
        self.scheduler.add_ready_task(task, cpu_hint, hint);
    }

    /// Issue fetches for remote regions this node does not hold yet. True
    /// when at least one fetch is pending; the completion callback of the
    /// last one enqueues the task.
    fn fetch_remote_data(self: &Arc<Self>, services: Arc<ClusterServices>, task: &Arc<Task>) -> bool {
        let fetches: Vec<(DataRegion, usize, u64)> = {
            let inner = task.accesses.lock();
            inner
                .arena
                .iter()
                .filter_map(|(_, access)| {
                    if access.is_taskwait_fragment() || access.is_weak() {
                        return None;
                    }
                    let region = access.region();
                    let write_id = access.write_id();
                    match access.location() {
                        Some(MemoryPlace::ClusterNode(source))
                            if source != services.node_id
                                && write_id != 0
                                && !self.engine.write_ids.is_local(&region, write_id) =>
                        {
                            Some((region, source, write_id))
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        if fetches.is_empty() {
            return false;
        }

        // The +1 guard keeps the gate from firing until every fetch below
        // has been issued.
        let gate = Arc::new(AtomicUsize::new(1));

        for (region, source, write_id) in fetches {
            gate.fetch_add(1, Ordering::AcqRel);
            let callback: Box<dyn FnOnce() + Send> = {
                let runtime = self.clone();
                let task = task.clone();
                let gate = gate.clone();
                Box::new(move || {
                    runtime.engine.write_ids.record_local(region, write_id);
                    if gate.fetch_sub(1, Ordering::AcqRel) == 1 {
                        runtime
                            .scheduler
                            .add_ready_task(task, None, ReadyTaskHint::Unblocked);
                    }
                })
            };

            // An in-flight transfer already covering this region gets a
            // callback attached instead of a duplicate fetch.
            if let Err(callback) = services.transfers.attach_if_contained(&region, callback) {
                match services.messenger.fetch_data(region, source, 0, false) {
                    Some(handle) => services.transfers.track(region, handle, callback),
                    // Completed synchronously.
                    None => callback(),
                }
            }
        }

        if gate.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.scheduler
                .add_ready_task(task.clone(), None, ReadyTaskHint::Unblocked);
        }
        true
    }

    // --- execution ---

    pub(crate) fn execute_task(self: &Arc<Self>, task: Arc<Task>, cpu: Option<usize>) {
        run_task_body(self, &task);
        self.finish_task(&task, cpu);
    }

    /// Runs with the thread-local current task already set.
    pub(crate) fn run_body(self: &Arc<Self>, task: &Arc<Task>) {
        let started = Instant::now();
        match task.take_body() {
            Some(TaskBody::Closure(body)) => body(),
            Some(TaskBody::Typed { info, mut args }) => (info.run)(&mut args),
            None => {}
        }
        if let Some(label) = task.label() {
            self.wisdom.record(label, started.elapsed().as_secs_f64());
        }
        self.record_written_locations(task);
    }

    /// After the body, written regions live here: stamp fresh write ids so
    /// later readers elsewhere can skip transfers when they already match.
    fn record_written_locations(self: &Arc<Self>, task: &Arc<Task>) {
        let place = match &self.cluster {
            Some(services) => MemoryPlace::ClusterNode(services.node_id),
            None => MemoryPlace::Host,
        };
        let inner = task.accesses.lock();
        for (_, access) in inner.arena.iter() {
            if access.is_weak() || access.is_taskwait_fragment() {
                continue;
            }
            let writes = matches!(
                access.access_type(),
                AccessType::Out
                    | AccessType::InOut
                    | AccessType::Concurrent
                    | AccessType::Commutative
            );
            if writes {
                let write_id = self.engine.write_ids.fresh();
                access.set_location(place);
                access.set_write_id(write_id);
                self.engine
                    .write_ids
                    .record_local(access.region(), write_id);
            }
        }
    }

    pub(crate) fn finish_task(self: &Arc<Self>, task: &Arc<Task>, cpu: Option<usize>) {
        task.set_flag(TaskFlags::FINISHED);
        if task.decrease_release_count(1) {
            self.release_task(task, cpu);
        }
    }

    /// Release counter reached zero: unregister accesses, propagate to
    /// successors, then dispose.
    pub(crate) fn release_task(self: &Arc<Self>, task: &Arc<Task>, cpu: Option<usize>) {
        let mut batch = CpuDependencyData::new();
        self.engine.unregister_task_accesses(task, &mut batch);
        self.engine.process_delayed(&mut batch);
        batch.removable_tasks.push(task.clone());
        self.drain_batch(&mut batch, cpu);
    }

    fn dispose_task(self: &Arc<Self>, task: Arc<Task>, batch: &mut CpuDependencyData) {
        if !task.mark_as_released() {
            return;
        }
        tracing::trace!(task = %task.id(), "disposing task");

        if let Some(services) = &self.cluster {
            if let Some(offload::ClusterTaskContext::Offloaded { target_node }) =
                &*task.cluster.lock()
            {
                tracing::trace!(task = %task.id(), target_node, "remote execution released");
            }
            offload::report_wrapper_finished(services, &task);
        }
        if let Some(callback) = task.take_completion() {
            callback();
        }
        if let Some(parent) = task.parent()
            && parent.child_disposed()
        {
            // The parent was only waiting for its children: cascade.
            self.engine.unregister_task_accesses(&parent, batch);
            self.engine.process_delayed(batch);
            batch.removable_tasks.push(parent);
        }
        self.live_task_disposed();
    }

    /// Release step of an offloaded task's workflow: the remote side
    /// finished, release the local representation.
    pub(crate) fn finish_offloaded_representation(self: &Arc<Self>, task: &Arc<Task>) {
        task.set_flag(TaskFlags::FINISHED);
        if task.decrease_release_count(1) {
            self.release_task(task, context::current_cpu());
        }
    }

    // --- taskwait and blocking ---

    pub(crate) fn taskwait(self: &Arc<Self>) {
        let Some(task) = context::current_task() else {
            self.wait_quiescent();
            return;
        };

        let mut batch = CpuDependencyData::new();
        let fragments = self.engine.register_taskwait_fragments(&task, &mut batch);
        // Arm before processing: fragments may satisfy during the drain.
        task.arm_taskwait(fragments);
        self.engine.process_delayed(&mut batch);
        self.drain_batch(&mut batch, context::current_cpu());

        cooperative_wait(self, Some(&task), || !task.taskwait_pending());
    }

    pub(crate) fn block_current_task(self: &Arc<Self>) {
        let Some(task) = context::current_task() else {
            fatal("blocking", format_args!("block_current_task outside a task"));
        };
        task.mark_blocked();
        cooperative_wait(self, Some(&task), || !task.is_blocked());
    }

    pub(crate) fn unblock_task(&self, task: &Arc<Task>) {
        task.unblock();
    }

    // --- shutdown ---

    pub(crate) fn shutdown(self: &Arc<Self>) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wait_quiescent();

        if let Some(services) = &self.cluster {
            if services.node_id == 0 {
                for node in 1..services.cluster_size {
                    services
                        .messenger
                        .send_message(Message::SysFinish, node, false);
                }
            }
            services.namespace.mark_draining();
            services.namespace.join();
        }

        self.shutting_down.store(true, Ordering::Release);
        self.idle.resume_all();
        if let Some(pool) = self.pool.get()
            && let Err(error) = pool.join_all()
        {
            tracing::warn!(%error, "worker pool shut down uncleanly");
        }
        if let Err(error) = self.wisdom.store() {
            tracing::warn!(%error, "failed to persist wisdom file");
        }
    }
}
