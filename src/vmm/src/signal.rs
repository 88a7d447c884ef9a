// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Signal delivery engine: per-vCPU and process-wide pending queues drawn
//! from a fixed-size free pool, priority dequeue, and in-guest signal frame
//! construction that mimics a kernel `sigreturn` ABI.

use std::sync::Mutex;

use kvm_bindings::kvm_regs;

/// Fixed pool size. Exhaustion is fatal by design (SPEC_FULL.md §9): growing
/// it dynamically would let a runaway guest exhaust host memory purely
/// through signal floods.
const NSIGENTRY: usize = 8;

pub const SI_KERNEL: i32 = 0x80;
pub const SI_USER: i32 = 0;

const SIGRTMIN: i32 = 34;
const NSIG: i32 = 65;

pub const SA_SIGINFO: u64 = 4;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

#[derive(Clone, Copy, Debug, Default)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_code: i32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub mask: u64,
}

/// 64 signal numbers fit in a single bitmask; this is a closed, fixed-size
/// guest-compatible representation, not `std`'s unstable `sigset_t`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);

    pub fn add(&mut self, signo: i32) {
        self.0 |= 1u64 << (signo - 1);
    }

    pub fn contains(&self, signo: i32) -> bool {
        self.0 & (1u64 << (signo - 1)) != 0
    }

    pub fn union(&mut self, other: SigSet) {
        self.0 |= other.0;
    }
}

fn set_of(signos: &[i32]) -> SigSet {
    let mut s = SigSet::EMPTY;
    for &signo in signos {
        s.add(signo);
    }
    s
}

/// Classification sets, built once at startup (`SignalClasses::new`) mirroring
/// `km_signal_init`'s static sigsets.
pub struct SignalClasses {
    pub perror: SigSet,
    pub def_ign: SigSet,
    pub ign_block: SigSet,
    pub no_catch: SigSet,
}

impl SignalClasses {
    pub fn new() -> Self {
        SignalClasses {
            perror: set_of(&[
                libc::SIGFPE,
                libc::SIGILL,
                libc::SIGSEGV,
                libc::SIGBUS,
                libc::SIGABRT,
                libc::SIGTRAP,
                libc::SIGSYS,
            ]),
            def_ign: set_of(&[libc::SIGCHLD, libc::SIGURG, libc::SIGWINCH]),
            ign_block: set_of(&[libc::SIGBUS, libc::SIGFPE, libc::SIGILL, libc::SIGSEGV]),
            no_catch: set_of(&[libc::SIGKILL, libc::SIGSTOP]),
        }
    }
}

impl Default for SignalClasses {
    fn default() -> Self {
        Self::new()
    }
}

fn sigpri(classes: &SignalClasses, signo: i32) -> i32 {
    if classes.perror.contains(signo) {
        0
    } else {
        -signo
    }
}

#[derive(Default)]
struct SignalList {
    entries: Vec<SigInfo>,
}

/// Process-wide signal state: the free-pool-backed pending queue and the
/// sigaction table. Guarded by a single mutex (SPEC_FULL.md §5's "signal
/// lock"); vCPU-local pending queues and masks are owned by each `VcpuSignals`
/// and require no lock beyond the shared free-pool accounting.
pub struct SignalEngine {
    classes: SignalClasses,
    shared: Mutex<SharedState>,
}

struct SharedState {
    free_count: usize,
    process_pending: SignalList,
    sigactions: [SigAction; NSIG as usize],
}

pub struct VcpuSignals {
    pub mask: SigSet,
    pending: SignalList,
}

impl VcpuSignals {
    pub fn new() -> Self {
        VcpuSignals {
            mask: SigSet::EMPTY,
            pending: SignalList::default(),
        }
    }
}

impl Default for VcpuSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalEngine {
    pub fn new() -> Self {
        SignalEngine {
            classes: SignalClasses::new(),
            shared: Mutex::new(SharedState {
                free_count: NSIGENTRY,
                process_pending: SignalList::default(),
                sigactions: [SigAction::default(); NSIG as usize],
            }),
        }
    }

    /// Enqueues `info` either to `vcpu`'s own pending list (thread-directed)
    /// or the process-wide list. Non-RT signals are coalesced: if the target
    /// already has an identical `si_signo` pending, the post is dropped.
    /// Returns `true` if the vCPU (when thread-directed) should be woken via
    /// `SIGVCPUSTOP`.
    pub fn post_signal(&self, vcpu: Option<&mut VcpuSignals>, info: SigInfo) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let already_pending = if info.si_signo < SIGRTMIN {
            match &vcpu {
                Some(v) => {
                    v.pending.entries.iter().any(|s| s.si_signo == info.si_signo)
                        || shared
                            .process_pending
                            .entries
                            .iter()
                            .any(|s| s.si_signo == info.si_signo)
                }
                None => shared
                    .process_pending
                    .entries
                    .iter()
                    .any(|s| s.si_signo == info.si_signo),
            }
        } else {
            false
        };
        if already_pending {
            return false;
        }
        if shared.free_count == 0 {
            panic!("signal engine: free pool exhausted ({NSIGENTRY} entries)");
        }
        shared.free_count -= 1;
        match vcpu {
            Some(v) => {
                v.pending.entries.push(info);
                true
            }
            None => {
                shared.process_pending.entries.push(info);
                false
            }
        }
    }

    fn dequeue(&self, list: &mut SignalList, blocked: &SigSet, shared_free: &mut usize) -> Option<SigInfo> {
        let mut chosen_idx = None;
        for (i, sig) in list.entries.iter().enumerate() {
            if blocked.contains(sig.si_signo) {
                let bypass = self.classes.ign_block.contains(sig.si_signo) && sig.si_code == SI_KERNEL;
                if !bypass {
                    continue;
                }
            }
            match chosen_idx {
                None => chosen_idx = Some(i),
                Some(best) => {
                    if sigpri(&self.classes, sig.si_signo) > sigpri(&self.classes, list.entries[best].si_signo) {
                        chosen_idx = Some(i);
                    }
                }
            }
        }
        chosen_idx.map(|i| {
            *shared_free += 1;
            list.entries.remove(i)
        })
    }

    /// Picks the next deliverable signal for `vcpu`: first its own pending
    /// queue, then the process-wide one.
    pub fn next_signal(&self, vcpu: &mut VcpuSignals) -> Option<SigInfo> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(info) = self.dequeue(&mut vcpu.pending, &vcpu.mask, &mut shared.free_count) {
            return Some(info);
        }
        let process_pending = &mut shared.process_pending;
        let mask = vcpu.mask;
        let mut shared_free = 0usize;
        let result = self.dequeue(process_pending, &mask, &mut shared_free);
        shared.free_count += shared_free;
        result
    }

    /// Whether `sig` is deliverable to a vCPU masking with `mask`: either it
    /// isn't blocked, or it's a program-error signal with `SI_KERNEL` that
    /// bypasses the mask. Mirrors the bypass `dequeue` applies.
    fn is_ready(&self, sig: &SigInfo, mask: &SigSet) -> bool {
        if !mask.contains(sig.si_signo) {
            return true;
        }
        self.classes.ign_block.contains(sig.si_signo) && sig.si_code == SI_KERNEL
    }

    /// `true` if a deliverable signal exists for `vcpu`, transferring a
    /// matching process-wide signal into the vCPU's own queue (claim-once
    /// semantics) as a side effect.
    pub fn signal_ready(&self, vcpu: &mut VcpuSignals) -> i32 {
        if let Some(sig) = vcpu
            .pending
            .entries
            .iter()
            .find(|s| self.is_ready(s, &vcpu.mask))
        {
            return sig.si_signo;
        }
        let mut shared = self.shared.lock().unwrap();
        let idx = shared
            .process_pending
            .entries
            .iter()
            .position(|s| self.is_ready(s, &vcpu.mask));
        if let Some(idx) = idx {
            let sig = shared.process_pending.entries.remove(idx);
            let signo = sig.si_signo;
            vcpu.pending.entries.push(sig);
            return signo;
        }
        0
    }

    pub fn pending_set(&self, vcpu: &VcpuSignals) -> SigSet {
        let mut set = SigSet::EMPTY;
        for s in &vcpu.pending.entries {
            set.add(s.si_signo);
        }
        let shared = self.shared.lock().unwrap();
        for s in &shared.process_pending.entries {
            set.add(s.si_signo);
        }
        set
    }

    pub fn sigaction(&self, signo: i32, new: Option<SigAction>) -> Result<SigAction, i64> {
        if !(1..NSIG).contains(&signo) {
            return Err(-libc::EINVAL as i64);
        }
        if self.classes.no_catch.contains(signo) {
            return Err(-libc::EINVAL as i64);
        }
        let mut shared = self.shared.lock().unwrap();
        let old = shared.sigactions[signo as usize];
        if let Some(act) = new {
            shared.sigactions[signo as usize] = act;
        }
        Ok(old)
    }

    fn action_for(&self, signo: i32) -> SigAction {
        self.shared.lock().unwrap().sigactions[signo as usize]
    }

    pub fn is_def_ignored(&self, signo: i32) -> bool {
        self.classes.def_ign.contains(signo)
    }

    pub fn is_program_error(&self, signo: i32) -> bool {
        self.classes.perror.contains(signo)
    }

    /// `rt_sigprocmask`-equivalent: pure vCPU-local mask update.
    pub fn sigprocmask(vcpu: &mut VcpuSignals, how: i32, set: Option<SigSet>) -> SigSet {
        let old = vcpu.mask;
        if let Some(set) = set {
            match how {
                libc::SIG_BLOCK => vcpu.mask.union(set),
                libc::SIG_UNBLOCK => vcpu.mask.0 &= !set.0,
                libc::SIG_SETMASK => vcpu.mask = set,
                _ => {}
            }
        }
        old
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The stack frame the monitor builds in guest memory so that resuming the
/// vCPU enters a user signal handler and can return via a `sigreturn`
/// trampoline. Field order and size are part of the guest runtime ABI.
pub const RED_ZONE: u64 = 128;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalFrame {
    pub return_addr: u64,
    pub hc_ret: u64,
    pub hc_args: [u64; 6],
    pub regs: kvm_regs,
    pub info: SigInfo,
    pub saved_mask: SigSet,
    pub interrupted_rip: u64,
}

/// Outcome of attempting delivery of the next pending signal to a vCPU.
pub enum Delivery {
    /// Nothing was pending, or the pending signal was ignored.
    None,
    /// The vCPU's register file was rewritten to enter the guest handler at
    /// `frame_gva`; registers are already written back through `set_regs`.
    Handled,
    /// Default disposition terminates the guest with `signo`, and a core
    /// dump should be written first if `core`.
    Terminate { signo: i32, core: bool },
}

/// Builds a handler-entry frame and the new register file, given the
/// current stack pointer and saved register state. The caller is
/// responsible for writing `frame_bytes` at `frame_gva` (translated through
/// the memory manager) and loading `new_regs` into the vCPU.
pub fn build_guest_handler_frame(
    current_regs: &kvm_regs,
    sigmask: SigSet,
    info: SigInfo,
    act: &SigAction,
    sigreturn_trampoline: u64,
) -> (u64, SignalFrame, kvm_regs, SigSet) {
    let frame_gva = current_regs.rsp - RED_ZONE - std::mem::size_of::<SignalFrame>() as u64;
    let frame = SignalFrame {
        return_addr: sigreturn_trampoline,
        hc_ret: 0,
        hc_args: [0; 6],
        regs: *current_regs,
        info,
        saved_mask: sigmask,
        interrupted_rip: current_regs.rip,
    };

    let mut new_mask = sigmask;
    if act.flags & SA_SIGINFO != 0 {
        new_mask.union(SigSet(act.mask));
    }
    new_mask.add(info.si_signo);

    let info_offset = memoffset_info();
    let ucontext_offset = memoffset_ucontext();

    let mut new_regs = *current_regs;
    new_regs.rsp = frame_gva;
    new_regs.rip = act.handler;
    new_regs.rdi = info.si_signo as u64;
    new_regs.rsi = frame_gva + info_offset;
    new_regs.rdx = frame_gva + ucontext_offset;

    (frame_gva, frame, new_regs, new_mask)
}

fn memoffset_info() -> u64 {
    let base = std::mem::offset_of!(SignalFrame, info);
    base as u64
}

fn memoffset_ucontext() -> u64 {
    let base = std::mem::offset_of!(SignalFrame, saved_mask);
    base as u64
}

impl SignalEngine {
    /// Drives one delivery attempt for `vcpu`: dequeues the next signal
    /// (if any), consults its disposition, and reports what the caller
    /// (the vCPU loop) must do next.
    pub fn deliver(&self, vcpu: &mut VcpuSignals) -> Option<(SigInfo, SigAction)> {
        let info = self.next_signal(vcpu)?;
        let act = self.action_for(info.si_signo);
        if act.handler == SIG_IGN {
            return None;
        }
        if act.handler == SIG_DFL {
            if self.is_def_ignored(info.si_signo) {
                return None;
            }
            return Some((info, act));
        }
        Some((info, act))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(signo: i32, code: i32) -> SigInfo {
        SigInfo {
            si_signo: signo,
            si_code: code,
        }
    }

    #[test]
    fn coalesces_non_rt_duplicate_posts() {
        let engine = SignalEngine::new();
        let mut vcpu = VcpuSignals::new();
        assert!(engine.post_signal(Some(&mut vcpu), info(libc::SIGUSR1, SI_USER)));
        assert!(!engine.post_signal(Some(&mut vcpu), info(libc::SIGUSR1, SI_USER)));
        assert!(engine.next_signal(&mut vcpu).is_some());
        assert!(engine.next_signal(&mut vcpu).is_none());
    }

    #[test]
    fn program_error_has_priority() {
        let engine = SignalEngine::new();
        let mut vcpu = VcpuSignals::new();
        engine.post_signal(Some(&mut vcpu), info(libc::SIGUSR1, SI_USER));
        engine.post_signal(Some(&mut vcpu), info(libc::SIGSEGV, SI_USER));
        let first = engine.next_signal(&mut vcpu).unwrap();
        assert_eq!(first.si_signo, libc::SIGSEGV);
    }

    #[test]
    fn ignore_block_bypasses_mask_on_si_kernel() {
        let engine = SignalEngine::new();
        let mut vcpu = VcpuSignals::new();
        vcpu.mask.add(libc::SIGSEGV);
        engine.post_signal(Some(&mut vcpu), info(libc::SIGSEGV, SI_KERNEL));
        let signo = engine.signal_ready(&mut vcpu);
        assert_eq!(signo, libc::SIGSEGV);
    }

    #[test]
    fn masked_signal_is_not_ready() {
        let engine = SignalEngine::new();
        let mut vcpu = VcpuSignals::new();
        vcpu.mask.add(libc::SIGUSR1);
        engine.post_signal(Some(&mut vcpu), info(libc::SIGUSR1, SI_USER));
        assert_eq!(engine.signal_ready(&mut vcpu), 0);
    }

    #[test]
    fn process_wide_signal_is_claimed_once() {
        let engine = SignalEngine::new();
        let mut vcpu_a = VcpuSignals::new();
        let mut vcpu_b = VcpuSignals::new();
        engine.post_signal(None, info(libc::SIGUSR2, SI_USER));
        assert_eq!(engine.signal_ready(&mut vcpu_a), libc::SIGUSR2);
        assert_eq!(engine.signal_ready(&mut vcpu_b), 0);
    }

    #[test]
    fn sigaction_rejects_uncatchable_signals() {
        let engine = SignalEngine::new();
        assert!(engine.sigaction(libc::SIGKILL, None).is_err());
    }

    #[test]
    fn sigprocmask_block_unblock_setmask() {
        let mut vcpu = VcpuSignals::new();
        SignalEngine::sigprocmask(&mut vcpu, libc::SIG_BLOCK, Some(set_of(&[libc::SIGUSR1])));
        assert!(vcpu.mask.contains(libc::SIGUSR1));
        SignalEngine::sigprocmask(&mut vcpu, libc::SIG_UNBLOCK, Some(set_of(&[libc::SIGUSR1])));
        assert!(!vcpu.mask.contains(libc::SIGUSR1));
    }
}
