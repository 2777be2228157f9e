use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one CPU slot. Only the owning worker moves between the
/// acquired states; shutdown can interrupt from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    Uninitialized = 0,
    Enabled = 1,
    AcquiredRunning = 2,
    AcquiredIdle = 3,
    ShuttingDown = 4,
    Terminated = 5,
}

impl CpuState {
    fn from_u8(v: u8) -> CpuState {
        match v {
            0 => CpuState::Uninitialized,
            1 => CpuState::Enabled,
            2 => CpuState::AcquiredRunning,
            3 => CpuState::AcquiredIdle,
            4 => CpuState::ShuttingDown,
            _ => CpuState::Terminated,
        }
    }
}

struct ParkState {
    resumed: bool,
}

/// One usable CPU: identity, NUMA node, state word and the private parking
/// spot its worker sleeps on when idle. `id` is the runtime's dense index
/// (queue slots, idle bitmap); `os_id` is what the kernel knows the CPU as.
pub(crate) struct Cpu {
    pub(crate) id: usize,
    pub(crate) os_id: usize,
    pub(crate) numa_node: usize,
    state: AtomicU8,
    park: Mutex<ParkState>,
    unparked: Condvar,
}

impl Cpu {
    pub(crate) fn new(id: usize, os_id: usize, numa_node: usize) -> Self {
        Self {
            id,
            os_id,
            numa_node,
            state: AtomicU8::new(CpuState::Uninitialized as u8),
            park: Mutex::new(ParkState { resumed: false }),
            unparked: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Park until [`resume`](Self::resume) or until `should_stop` returns
    /// true. A resume that lands before the park is never lost: the flag is
    /// checked under the same lock the waiter sleeps on.
    pub(crate) fn park(&self, should_stop: impl Fn() -> bool) {
        let mut park = self.park.lock();
        while !park.resumed && !should_stop() {
            self.unparked
                .wait_for(&mut park, std::time::Duration::from_millis(10));
        }
        park.resumed = false;
    }

    pub(crate) fn resume(&self) {
        let mut park = self.park.lock();
        park.resumed = true;
        self.unparked.notify_one();
    }
}

/// Pin the calling thread to `cpu_id`. Best effort off Linux.
pub(crate) fn pin_current_thread(cpu_id: usize) {
    #[cfg(target_os = "linux")]
    // Safety: cpu_set_t is plain data; sched_setaffinity only reads the set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(cpu_id, "failed to pin worker thread");
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cpu_id;
}
