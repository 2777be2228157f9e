use crate::cluster::ClusterServices;
use crate::cluster::message::{
    AccessInfo, Message, RemoteAccessReleaseMsg, SatisfiabilityMsg, TaskNewMsg,
};
use crate::deps::access::{AccessFlags, AccessType, DataAccess};
use crate::deps::batch::{CpuDependencyData, UpdateOperation};
use crate::deps::bottom_map::BottomMapEntry;
use crate::deps::region::DataRegion;
use crate::error::fatal;
use crate::numa::MemoryPlace;
use crate::runtime::RuntimeInner;
use crate::task::{Task, TaskBody, TaskFlags, TaskId};
use crate::workflow::TaskWorkflow;
use crate::workflow::cluster::ClusterDataLinkStep;
use std::sync::Arc;

/// Which side of an offload a task sits on.
pub(crate) enum ClusterTaskContext {
    /// Local representation of a task sent to `target_node`.
    Offloaded { target_node: usize },
    /// Wrapper standing in for a task received from `offloader_node`.
    RemoteWrapper {
        offloader_node: usize,
        offloader_task: TaskId,
    },
}

fn access_type_to_wire(ty: AccessType) -> u8 {
    match ty {
        AccessType::In => 0,
        AccessType::Out => 1,
        AccessType::InOut => 2,
        AccessType::Concurrent => 3,
        AccessType::Commutative => 4,
        AccessType::Reduction => 5,
        AccessType::NoAccess => 6,
    }
}

fn access_type_from_wire(tag: u8) -> AccessType {
    match tag {
        0 => AccessType::In,
        1 => AccessType::Out,
        2 => AccessType::InOut,
        3 => AccessType::Concurrent,
        4 => AccessType::Commutative,
        5 => AccessType::Reduction,
        6 => AccessType::NoAccess,
        other => fatal("cluster", format_args!("unknown access type tag {other}")),
    }
}

fn wire_location(location: Option<MemoryPlace>) -> i32 {
    match location {
        Some(MemoryPlace::ClusterNode(node)) => node as i32,
        _ => -1,
    }
}

fn place_from_wire(location: i32) -> Option<MemoryPlace> {
    (location >= 0).then(|| MemoryPlace::ClusterNode(location as usize))
}

/// Offload protocol, sender side: replace the task's execution with a
/// cluster workflow, ship a TaskNew carrying the satisfiability known right
/// now, and leave a data-link step on every access for what arrives later.
pub(crate) fn offload_task(
    runtime: &Arc<RuntimeInner>,
    services: &ClusterServices,
    task: &Arc<Task>,
    target: usize,
) {
    task.set_flag(TaskFlags::OFFLOADED);
    *task.cluster.lock() = Some(ClusterTaskContext::Offloaded {
        target_node: target,
    });

    let workflow = TaskWorkflow::new_offloaded(task);
    *task.workflow.lock() = Some(workflow.clone());

    let mut infos = Vec::new();
    let mut links: Vec<Arc<ClusterDataLinkStep>> = Vec::new();
    {
        let inner = task.accesses.lock();
        for (_, access) in inner.arena.iter() {
            if access.is_taskwait_fragment() {
                continue;
            }
            let region = access.region();
            infos.push(AccessInfo {
                access_type: access_type_to_wire(access.access_type()),
                weak: access.is_weak(),
                start: region.start() as u64,
                len: region.len() as u64,
                read_satisfied: access.read_satisfied(),
                write_satisfied: access.write_satisfied(),
                write_id: access.write_id(),
                location: wire_location(access.location()),
                namespace_predecessor: services.namespace_predecessor_for(&region, target),
            });
            links.push(ClusterDataLinkStep::install(
                access,
                services.messenger.clone(),
                target,
                task.id(),
            ));
        }
    }

    let Some((label, args)) = task.typed_body_parts() else {
        fatal("cluster", format_args!("offloading {} without a task type", task.id()));
    };

    services.offloaded.insert(task.id().0, task.clone());
    for info in &infos {
        services.record_offload(
            DataRegion::new(info.start as usize, info.len as usize),
            target,
            task.id().0,
        );
    }

    tracing::debug!(task = %task.id(), target, "offloading task");
    services.messenger.send_message(
        Message::TaskNew(TaskNewMsg {
            offloader_node: services.node_id as u32,
            offloader_task: task.id().0,
            label,
            args,
            priority: task.priority(),
            accesses: infos,
        }),
        target,
        false,
    );

    for link in links {
        link.start();
    }
    workflow.begin(runtime);
}

/// Dispatch one incoming control message. Runs on the node-namespace
/// thread.
pub(crate) fn handle_message(
    runtime: &Arc<RuntimeInner>,
    services: &ClusterServices,
    message: Message,
) {
    match message {
        Message::TaskNew(msg) => handle_task_new(runtime, services, msg),
        Message::TaskFinished { offloader_task } => {
            handle_task_finished(runtime, services, offloader_task)
        }
        Message::Satisfiability(msg) => handle_satisfiability(runtime, services, msg),
        Message::RemoteAccessRelease(msg) => handle_remote_release(services, msg),
        Message::Dfree { start, len } => {
            let region = DataRegion::new(start as usize, len as usize);
            runtime.directory.forget(region);
            runtime.engine.write_ids.forget(&region);
        }
        Message::SysFinish => services.namespace.mark_draining(),
    }
}

/// Offload protocol, receiver side: spawn a wrapper task whose accesses
/// carry the offloader-provided satisfiability, chained locally behind a
/// namespace predecessor when the offloader says that is valid.
fn handle_task_new(runtime: &Arc<RuntimeInner>, services: &ClusterServices, msg: TaskNewMsg) {
    let Some(info) = runtime.task_types.get(&msg.label).map(|e| e.value().clone()) else {
        fatal("cluster", format_args!("unknown task type {:?}", msg.label));
    };

    let offloader_node = msg.offloader_node as usize;
    let scope = services.namespace_scope.clone();
    let wrapper = Task::new(
        runtime.next_id(),
        Some(msg.label.clone()),
        Some(TaskBody::Typed {
            info,
            args: msg.args.clone(),
        }),
        TaskFlags::REMOTE,
        Some(scope.clone()),
        msg.priority,
    );
    *wrapper.cluster.lock() = Some(ClusterTaskContext::RemoteWrapper {
        offloader_node,
        offloader_task: TaskId(msg.offloader_task),
    });

    services
        .remote_wrappers
        .insert((offloader_node, msg.offloader_task), wrapper.clone());
    services.namespace.wrapper_started();
    scope.child_created();
    runtime.live_task_created();

    let mut batch = CpuDependencyData::new();
    register_remote_accesses(services, &wrapper, &msg.accesses, offloader_node, &mut batch);
    if wrapper.finish_registration() {
        batch.satisfied_originators.push(wrapper.clone());
    }
    runtime.engine.process_delayed(&mut batch);
    runtime.drain_batch(&mut batch, None);
}

/// The namespace scope chains wrappers from the same offloader so
/// satisfiability propagates locally without a round-trip; everything else
/// starts from the message's snapshot and waits for Satisfiability
/// messages.
fn register_remote_accesses(
    services: &ClusterServices,
    wrapper: &Arc<Task>,
    accesses: &[AccessInfo],
    offloader_node: usize,
    batch: &mut CpuDependencyData,
) {
    let scope_task = &services.namespace_scope;
    let mut scope = scope_task.accesses.lock();

    for info in accesses {
        let region = DataRegion::new(info.start as usize, info.len as usize);
        let ty = access_type_from_wire(info.access_type);
        let access = Arc::new(DataAccess::new(ty, region, wrapper, info.weak, false));
        wrapper.accesses.lock().arena.insert(access.clone());
        if !info.weak {
            wrapper.add_predecessor();
        }

        if let Some(place) = place_from_wire(info.location) {
            access.set_location(place);
        }
        if info.write_id != 0 {
            access.set_write_id(info.write_id);
        }

        // Try the namespace chain first.
        let mut initial = AccessFlags::empty();
        let mut chained = false;
        if info.namespace_predecessor != 0 {
            let keys = scope.overlapping_keys(&region);
            if let [key] = keys.as_slice() {
                let entry = &scope.bottom_map[key];
                let matches = entry.region == region
                    && entry.last.originator().is_some_and(|origin| {
                        matches!(
                            &*origin.cluster.lock(),
                            Some(ClusterTaskContext::RemoteWrapper {
                                offloader_node: node,
                                offloader_task,
                            }) if *node == offloader_node
                                && offloader_task.0 == info.namespace_predecessor
                        )
                    });
                if matches {
                    let last = entry.last.clone();
                    last.links.lock().successors.push((region, access.clone()));
                    last.mark_has_successor();
                    initial = last.propagated_snapshot();
                    scope.bottom_map.get_mut(key).expect("still there").last = access.clone();
                    chained = true;
                }
            }
        }

        if !chained {
            // Disconnected: satisfiability comes from the offloader. Old
            // entries under the region are displaced; later same-namespace
            // wrappers can chain behind this one.
            for key in scope.overlapping_keys(&region) {
                let old = scope.bottom_map.remove(&key).expect("key just collected");
                let (before, after) = old.region.subtract(&region);
                for piece in [before, after].into_iter().flatten() {
                    scope.insert_entry(BottomMapEntry {
                        region: piece,
                        last: old.last.clone(),
                        parent_access: None,
                    });
                }
            }
            scope.insert_entry(BottomMapEntry {
                region,
                last: access.clone(),
                parent_access: None,
            });
            if info.read_satisfied {
                initial |= AccessFlags::READ_SATISFIED;
            }
            if info.write_satisfied {
                initial |= AccessFlags::WRITE_SATISFIED;
            }
        }

        if !initial.is_empty() {
            batch.delayed.push_back(UpdateOperation::with_data(
                access,
                initial,
                place_from_wire(info.location),
                info.write_id,
            ));
        }
    }
}

fn handle_satisfiability(
    runtime: &Arc<RuntimeInner>,
    services: &ClusterServices,
    msg: SatisfiabilityMsg,
) {
    let key = (msg.offloader_node as usize, msg.offloader_task);
    let Some(wrapper) = services.remote_wrappers.get(&key).map(|e| e.value().clone()) else {
        // Channel ordering puts TaskNew first; a miss means the wrapper
        // already finished and this update is stale.
        return;
    };

    let region = DataRegion::new(msg.start as usize, msg.len as usize);
    let mut flags = AccessFlags::empty();
    if msg.read {
        flags |= AccessFlags::READ_SATISFIED;
    }
    if msg.write {
        flags |= AccessFlags::WRITE_SATISFIED;
    }

    let targets: Vec<Arc<DataAccess>> = wrapper
        .accesses
        .lock()
        .arena
        .iter()
        .filter(|(_, a)| a.region().overlaps(&region))
        .map(|(_, a)| a.clone())
        .collect();

    let mut batch = CpuDependencyData::new();
    for access in targets {
        batch.delayed.push_back(UpdateOperation::with_data(
            access,
            flags,
            place_from_wire(msg.location),
            msg.write_id,
        ));
    }
    runtime.engine.process_delayed(&mut batch);
    runtime.drain_batch(&mut batch, None);
}

fn handle_task_finished(runtime: &Arc<RuntimeInner>, services: &ClusterServices, id: u64) {
    let Some((_, task)) = services.offloaded.remove(&id) else {
        fatal("cluster", format_args!("TaskFinished for unknown task {id}"));
    };
    let workflow = task.workflow.lock().clone();
    match workflow {
        Some(workflow) => workflow.remote_finished(runtime),
        None => fatal("cluster", format_args!("offloaded {} has no workflow", task.id())),
    }
}

fn handle_remote_release(services: &ClusterServices, msg: RemoteAccessReleaseMsg) {
    let Some(task) = services.offloaded.get(&msg.offloader_task).map(|e| e.value().clone())
    else {
        return;
    };
    let region = DataRegion::new(msg.start as usize, msg.len as usize);
    let inner = task.accesses.lock();
    for (_, access) in inner.arena.iter() {
        if access.region().overlaps(&region) {
            if let Some(place) = place_from_wire(msg.location) {
                access.set_location(place);
            }
            if msg.write_id != 0 {
                access.set_write_id(msg.write_id);
            }
        }
    }
}

/// Wrapper-side completion: tell the offloader where the data ended up,
/// then report the task finished. Same channel, so the release lands first.
pub(crate) fn report_wrapper_finished(services: &ClusterServices, wrapper: &Arc<Task>) {
    let (offloader_node, offloader_task) = {
        let guard = wrapper.cluster.lock();
        match &*guard {
            Some(ClusterTaskContext::RemoteWrapper {
                offloader_node,
                offloader_task,
            }) => (*offloader_node, *offloader_task),
            _ => return,
        }
    };

    {
        let inner = wrapper.accesses.lock();
        for (_, access) in inner.arena.iter() {
            if access.is_taskwait_fragment() {
                continue;
            }
            let region = access.region();
            services.messenger.send_message(
                Message::RemoteAccessRelease(RemoteAccessReleaseMsg {
                    offloader_task: offloader_task.0,
                    start: region.start() as u64,
                    len: region.len() as u64,
                    write_id: access.write_id(),
                    location: wire_location(access.location()),
                }),
                offloader_node,
                false,
            );
        }
    }

    services.messenger.send_message(
        Message::TaskFinished {
            offloader_task: offloader_task.0,
        },
        offloader_node,
        false,
    );
    services
        .remote_wrappers
        .remove(&(offloader_node, offloader_task.0));
    services.namespace.wrapper_finished();
}
