// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The `Machine` container (component A): owns the vCPU table and the
//! process-wide signal engine, and coordinates cooperative pausing across
//! vCPU threads for snapshotting and fatal-signal termination.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_bindings::kvm_regs;

use crate::signal::{SignalEngine, VcpuSignals};

/// Per-vCPU bookkeeping the machine tracks outside of hardware register
/// state: thread-local signal queue/mask, pause/used flags, and the small
/// set of fields a snapshot's `NT_KM_VCPU` note needs to restore.
pub struct VcpuState {
    pub id: u64,
    pub signals: Mutex<VcpuSignals>,
    pub is_paused: AtomicBool,
    pub is_used: AtomicBool,
    /// `pthread_self()` of the OS thread currently running this vCPU, used
    /// to interrupt a blocked `KVM_RUN` with `SIGVCPUSTOP`. Zero until the
    /// vCPU thread has started.
    pub native_tid: AtomicU64,
    /// Remaining fields mirror `NT_KM_VCPU`'s payload and are written either
    /// before the vCPU thread starts (initial boot) or while every vCPU is
    /// paused (snapshot restore), but are kept atomic since they're reached
    /// through a shared `Arc<VcpuState>` either way.
    pub stack_top: AtomicU64,
    pub guest_thr: AtomicU64,
    pub set_child_tid: AtomicU64,
    pub clear_child_tid: AtomicU64,
    pub on_sigaltstack: AtomicBool,
    pub altstack_sp: AtomicU64,
    pub altstack_flags: AtomicU64,
    pub altstack_size: AtomicU64,
    pub mapself_base: AtomicU64,
    pub mapself_size: AtomicU64,
    /// This vCPU's register file plus `[cs, fs, gs, ds, es]` segment bases,
    /// captured by its own thread the moment it reports paused (including
    /// its final pause on the way out of the run loop). The snapshot writer
    /// reads this instead of reaching into a live `VcpuFd` from another
    /// thread, since by the time it runs every vCPU it cares about is
    /// already blocked in `wait_while_paused` or has exited for good.
    pub parked_regs: Mutex<Option<(kvm_regs, [u64; 5])>>,
}

impl VcpuState {
    pub fn new(id: u64) -> Self {
        VcpuState {
            id,
            signals: Mutex::new(VcpuSignals::new()),
            is_paused: AtomicBool::new(false),
            is_used: AtomicBool::new(true),
            native_tid: AtomicU64::new(0),
            stack_top: AtomicU64::new(0),
            guest_thr: AtomicU64::new(0),
            set_child_tid: AtomicU64::new(0),
            clear_child_tid: AtomicU64::new(0),
            on_sigaltstack: AtomicBool::new(false),
            altstack_sp: AtomicU64::new(0),
            altstack_flags: AtomicU64::new(0),
            altstack_size: AtomicU64::new(0),
            mapself_base: AtomicU64::new(0),
            mapself_size: AtomicU64::new(0),
            parked_regs: Mutex::new(None),
        }
    }
}

/// Process-wide state shared by every vCPU thread: the signal engine, the
/// pause barrier, and the exit status the guest requested.
pub struct Machine {
    pub signals: SignalEngine,
    pub vcpus: Mutex<Vec<Arc<VcpuState>>>,
    pause_requested: AtomicBool,
    pause_cv: Condvar,
    pause_mutex: Mutex<()>,
    pub exit_group: AtomicBool,
    pub exit_code: AtomicI32,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            signals: SignalEngine::new(),
            vcpus: Mutex::new(Vec::new()),
            pause_requested: AtomicBool::new(false),
            pause_cv: Condvar::new(),
            pause_mutex: Mutex::new(()),
            exit_group: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }
    }

    pub fn init_vcpu(&self, id: u64) -> Arc<VcpuState> {
        let state = Arc::new(VcpuState::new(id));
        self.vcpus.lock().unwrap().push(state.clone());
        state
    }

    pub fn vcpu_apply_all(&self, mut f: impl FnMut(&Arc<VcpuState>)) {
        for vcpu in self.vcpus.lock().unwrap().iter() {
            f(vcpu);
        }
    }

    /// Raises the pause request; each vCPU thread is expected to notice it
    /// at its next safe point (VM-exit boundary) and call
    /// [`Machine::vcpu_mark_paused`].
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        for vcpu in self.vcpus.lock().unwrap().iter() {
            vcpu.is_paused.store(false, Ordering::SeqCst);
        }
        let _guard = self.pause_mutex.lock().unwrap();
        self.pause_cv.notify_all();
    }

    pub fn vcpu_mark_paused(&self, vcpu: &VcpuState) {
        vcpu.is_paused.store(true, Ordering::SeqCst);
        let _guard = self.pause_mutex.lock().unwrap();
        self.pause_cv.notify_all();
    }

    /// Blocks a vCPU thread that just called [`Machine::vcpu_mark_paused`]
    /// until [`Machine::resume`] clears the pause request.
    pub fn wait_while_paused(&self) {
        let mut guard = self.pause_mutex.lock().unwrap();
        while self.pause_requested.load(Ordering::SeqCst) {
            guard = self.pause_cv.wait(guard).unwrap();
        }
    }

    /// Blocks the calling thread (the management thread, typically) until
    /// every allocated, in-use vCPU reports paused.
    pub fn wait_for_all_to_pause(&self) {
        let mut guard = self.pause_mutex.lock().unwrap();
        loop {
            let all_paused = self.vcpus.lock().unwrap().iter().all(|v| {
                !v.is_used.load(Ordering::SeqCst) || v.is_paused.load(Ordering::SeqCst)
            });
            if all_paused {
                return;
            }
            guard = self.pause_cv.wait(guard).unwrap();
        }
    }

    pub fn request_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.exit_group.store(true, Ordering::SeqCst);
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn pause_barrier_waits_for_all_used_vcpus() {
        let machine = Machine::new();
        let a = machine.init_vcpu(0);
        let b = machine.init_vcpu(1);
        machine.request_pause();
        machine.vcpu_mark_paused(&a);

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let m = Arc::new(machine);
        let m2 = m.clone();
        let handle = std::thread::spawn(move || {
            m2.wait_for_all_to_pause();
            done2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));
        m.vcpu_mark_paused(&b);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn unused_vcpu_slots_do_not_block_pause() {
        let machine = Machine::new();
        let a = machine.init_vcpu(0);
        let b = machine.init_vcpu(1);
        b.is_used.store(false, Ordering::SeqCst);
        machine.request_pause();
        machine.vcpu_mark_paused(&a);
        machine.wait_for_all_to_pause();
    }
}
