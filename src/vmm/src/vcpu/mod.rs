// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-vCPU setup and run loop. Owns the `VcpuFd`, brings the vCPU up into
//! 64-bit long mode, and then runs a blocking `KVM_RUN` loop that dispatches
//! trapped hypercalls into the memory manager, the signal engine, or the
//! generic hypercall table until the guest halts or exits.
//!
//! The GDT/page-table/sregs bootstrap below is folded into this module as
//! free functions rather than split across separate submodules: each vCPU
//! here independently runs the same flat-mode ELF payload, so there is no
//! kernel to SMP-boot and no need for the extra indirection. The loop uses
//! an on-demand `SIGVCPUSTOP` signal to interrupt a blocked `KVM_RUN` rather
//! than a periodic timer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kvm_bindings::{kvm_dtable, kvm_fpu, kvm_regs, kvm_segment, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

use crate::hypercall::{self, HcArgs, HcallOutcome, KM_HCALL_PORT_BASE};
use crate::machine::{Machine, VcpuState};
use crate::memory::{Memory, GUEST_KMGUESTMEM_BASE_VA};
use crate::net::NetHelper;
use crate::signal::{self, SigInfo, SigSet, SI_USER};

// ---- monitor scratch-page layout (guest-physical, below GUEST_MEM_START_VA) ----
const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;
const GDT_START: u64 = 0x500;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

/// Default address of the guest unikernel overlay's `rt_sigreturn`
/// trampoline. The trampoline's machine code is a payload-side runtime
/// stub (SPEC_FULL.md §1 names "the payload-side runtime stubs" as an
/// external collaborator); the monitor only needs to agree on where it
/// lives, which is why it is pinned to the base of the reserved unikernel
/// helper overlay (slot 42) rather than parsed out of a guest symbol table.
pub const SIGRETURN_TRAMPOLINE_GVA: u64 = GUEST_KMGUESTMEM_BASE_VA;

/// Real-time signal used to interrupt a blocked `KVM_RUN` when another
/// thread posts a signal to this vCPU or requests a pause. `SIGUSR1` would
/// collide with a guest-directed SIGUSR1 posted through `kill`/`tkill`
/// (those are virtual, queued signals delivered into the guest — this one
/// is a host-level nudge that never reaches guest code), so a dedicated
/// real-time number is used instead.
const SIGVCPUSTOP: i32 = libc::SIGRTMIN() + 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error issuing an ioctl to KVM")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    #[error("memory error")]
    Memory(#[from] crate::memory::Error),
    #[error("scratch page at {0:#x} is not backed by slot {KM_RSRV_MEMSLOT}")]
    MissingScratchPage(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    let b = base as u64;
    let l = limit as u64;
    let f = flags as u64;
    ((b & 0xFF00_0000) << (56 - 24))
        | ((f & 0x0000_F0FF) << 40)
        | ((l & 0x000F_0000) << (48 - 16))
        | ((b & 0x00FF_FFFF) << 16)
        | (l & 0x0000_FFFF)
}

fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let base = ((entry & 0xFF00_0000_0000_0000) >> 32)
        | ((entry & 0x0000_00FF_0000_0000) >> 16)
        | ((entry & 0x0000_0000_FFFF_0000) >> 16);
    let limit = ((entry & 0x000F_0000_0000_0000) >> 32) | (entry & 0xFFFF);
    let flags = (entry & 0x00F0_FF00_0000_0000) >> 40;
    kvm_segment {
        base,
        limit: limit as u32,
        selector: (table_index as u16) * 8,
        type_: (flags & 0xF) as u8,
        present: ((flags >> 7) & 0x1) as u8,
        dpl: ((flags >> 5) & 0x3) as u8,
        db: ((flags >> 14) & 0x1) as u8,
        s: ((flags >> 4) & 0x1) as u8,
        l: ((flags >> 13) & 0x1) as u8,
        g: ((flags >> 15) & 0x1) as u8,
        avl: ((flags >> 12) & 0x1) as u8,
        unusable: 0,
        padding: 0,
    }
}

/// vCPU object: hardware execution context (`VcpuFd`) plus the monitor-side
/// bookkeeping (`VcpuState`) arena-referenced from `Machine`.
pub struct Vcpu {
    pub id: u64,
    pub vcpu_fd: VcpuFd,
    pub state: Arc<VcpuState>,
}

impl Vcpu {
    pub fn new(vm_fd: &VmFd, id: u64, state: Arc<VcpuState>) -> Result<Self> {
        let vcpu_fd = vm_fd.create_vcpu(id).map_err(Error::KvmIoctl)?;
        Ok(Vcpu { id, vcpu_fd, state })
    }

    pub fn configure_cpuid(&self, kvm: &Kvm) -> Result<()> {
        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;
        self.vcpu_fd.set_cpuid2(&cpuid).map_err(Error::KvmIoctl)
    }

    pub fn configure_cpuid_with(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu_fd.set_cpuid2(cpuid).map_err(Error::KvmIoctl)
    }

    /// Writes identity-mapped long-mode page tables (first 1 GiB, 2 MiB
    /// pages) and the GDT into the monitor's low scratch slot.
    pub fn setup_page_tables_and_gdt(&self, memory: &Memory) -> Result<()> {
        let write_u64 = |gpa: u64, v: u64| -> Result<()> {
            let host = memory
                .scratch_host_ptr(gpa)
                .ok_or(Error::MissingScratchPage(gpa))?;
            unsafe { std::ptr::write_unaligned(host as *mut u64, v) };
            Ok(())
        };

        write_u64(PML4_START, PDPTE_START | 0x03)?;
        write_u64(PDPTE_START, PDE_START | 0x03)?;
        for i in 0u64..512 {
            write_u64(PDE_START + i * 8, (i << 21) | 0x83)?;
        }

        let gdt_table: [u64; 4] = [
            gdt_entry(0, 0, 0),
            gdt_entry(0xa09b, 0, 0xfffff),
            gdt_entry(0xc093, 0, 0xfffff),
            gdt_entry(0x808b, 0, 0xfffff),
        ];
        for (i, entry) in gdt_table.iter().enumerate() {
            write_u64(GDT_START + (i as u64) * 8, *entry)?;
        }
        Ok(())
    }

    pub fn configure_sregs(&self) -> Result<()> {
        let mut sregs = self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;

        let gdt_table: [u64; 4] = [
            gdt_entry(0, 0, 0),
            gdt_entry(0xa09b, 0, 0xfffff),
            gdt_entry(0xc093, 0, 0xfffff),
            gdt_entry(0x808b, 0, 0xfffff),
        ];
        let code_seg = kvm_segment_from_gdt(gdt_table[1], 1);
        let data_seg = kvm_segment_from_gdt(gdt_table[2], 2);
        let tss_seg = kvm_segment_from_gdt(gdt_table[3], 3);

        sregs.gdt = kvm_dtable {
            base: GDT_START,
            limit: std::mem::size_of_val(&gdt_table) as u16 - 1,
            padding: [0; 3],
        };
        sregs.idt = kvm_dtable {
            base: 0,
            limit: 0,
            padding: [0; 3],
        };

        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;
        sregs.tr = tss_seg;

        sregs.cr0 |= X86_CR0_PE;
        sregs.efer |= EFER_LME | EFER_LMA;
        sregs.cr3 = PML4_START;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PG;

        self.vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)
    }

    pub fn configure_regs(&self, entry: u64, stack_top: u64) -> Result<()> {
        let regs = kvm_regs {
            rflags: 0x0000_0000_0000_0002u64,
            rip: entry,
            rsp: stack_top,
            rbp: stack_top,
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)
    }

    pub fn configure_fpu(&self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu_fd.set_fpu(&fpu).map_err(Error::KvmIoctl)
    }

    /// Routes LINT0/LINT1 the way a single flat-mode vCPU needs them:
    /// LINT0 as ExtINT, LINT1 as NMI. No guest OS ever programs the APIC
    /// here, so the monitor sets these once at boot instead.
    pub fn configure_lapic(&self) -> Result<()> {
        const APIC_LVT0: usize = 0x350;
        const APIC_LVT1: usize = 0x360;
        const APIC_MODE_EXTINT: u32 = 0x7;
        const APIC_MODE_NMI: u32 = 0x4;

        let mut lapic = self.vcpu_fd.get_lapic().map_err(Error::KvmIoctl)?;
        let lvt0 = get_klapic_reg(&lapic, APIC_LVT0);
        set_klapic_reg(&mut lapic, APIC_LVT0, set_apic_delivery_mode(lvt0, APIC_MODE_EXTINT));
        let lvt1 = get_klapic_reg(&lapic, APIC_LVT1);
        set_klapic_reg(&mut lapic, APIC_LVT1, set_apic_delivery_mode(lvt1, APIC_MODE_NMI));
        self.vcpu_fd.set_lapic(&lapic).map_err(Error::KvmIoctl)
    }
}

fn get_klapic_reg(lapic: &kvm_bindings::kvm_lapic_state, reg_offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&lapic.regs[reg_offset..reg_offset + 4]);
    u32::from_le_bytes(raw)
}

fn set_klapic_reg(lapic: &mut kvm_bindings::kvm_lapic_state, reg_offset: usize, value: u32) {
    let bytes = value.to_le_bytes();
    lapic.regs[reg_offset..reg_offset + 4].copy_from_slice(&bytes);
}

fn set_apic_delivery_mode(reg: u32, mode: u32) -> u32 {
    (reg & !0x700) | (mode << 8)
}

/// Installs a no-op handler for `SIGVCPUSTOP` on the calling thread so a
/// blocked `KVM_RUN` can be interrupted without killing the process, and
/// records this OS thread as the vCPU's current runner.
fn arm_vcpu_stop_signal(state: &VcpuState) {
    unsafe {
        libc::signal(SIGVCPUSTOP, noop_handler as *const () as libc::sighandler_t);
    }
    state
        .native_tid
        .store(unsafe { libc::pthread_self() as u64 }, Ordering::SeqCst);
}

extern "C" fn noop_handler(_sig: libc::c_int) {}

/// Interrupts `state`'s vCPU thread if it is currently blocked in
/// `KVM_RUN`, so it notices a posted signal or a pause request promptly
/// rather than waiting for the next unrelated VM-exit.
pub fn nudge(state: &VcpuState) {
    let tid = state.native_tid.load(Ordering::SeqCst);
    if tid != 0 {
        unsafe {
            libc::pthread_kill(tid as libc::pthread_t, SIGVCPUSTOP);
        }
    }
}

/// Everything the run loop needs beyond the vCPU's own fields.
pub struct RunContext<'a> {
    pub machine: &'a Machine,
    pub memory: &'a Memory,
    pub net: &'a NetHelper,
    pub vm_fd: &'a VmFd,
    pub sigreturn_trampoline: u64,
}

/// Terminal outcome of the run loop.
pub enum Stop {
    /// Guest called `exit`/`exit_group` with this status.
    Exited(i32),
    /// A default-disposition fatal signal terminated the guest; `core` says
    /// whether a core dump should be written by the caller before exiting.
    Killed { signo: i32, core: bool },
}

impl Vcpu {
    /// Runs the blocking `KVM_RUN` loop until the guest exits, is killed by
    /// a fatal signal, or the machine requests pause and later resume (in
    /// which case the loop simply continues once resumed).
    pub fn run(&mut self, ctx: &RunContext) -> Stop {
        arm_vcpu_stop_signal(&self.state);
        self.state.is_used.store(true, Ordering::SeqCst);

        let stop = self.run_inner(ctx);
        // Every exit path (this vCPU's own exit/kill, or another vCPU's
        // exit_group pulling this one down) must still report itself
        // paused and leave its final register file behind, or a concurrent
        // snapshot/core-dump waiting on `Machine::wait_for_all_to_pause`
        // would either block forever or read a stale `parked_regs`.
        self.capture_parked_regs();
        ctx.machine.vcpu_mark_paused(&self.state);
        stop
    }

    /// Snapshots this vCPU's register file and code/data segment bases into
    /// `state.parked_regs`, for a pausing or exiting vCPU to publish its
    /// state to whichever thread eventually calls `snapshot::write_snapshot`.
    fn capture_parked_regs(&self) {
        let regs = match self.vcpu_fd.get_regs() {
            Ok(r) => r,
            Err(_) => return,
        };
        let seg_bases = match self.vcpu_fd.get_sregs() {
            Ok(s) => [s.cs.base, s.fs.base, s.gs.base, s.ds.base, s.es.base],
            Err(_) => [0; 5],
        };
        *self.state.parked_regs.lock().unwrap() = Some((regs, seg_bases));
    }

    fn run_inner(&mut self, ctx: &RunContext) -> Stop {
        loop {
            if ctx.machine.exit_group.load(Ordering::SeqCst) {
                return Stop::Exited(ctx.machine.exit_code.load(Ordering::SeqCst));
            }

            if ctx.machine.pause_requested() {
                self.capture_parked_regs();
                ctx.machine.vcpu_mark_paused(&self.state);
                ctx.machine.wait_while_paused();
            }

            if let Some(stop) = self.service_pending_signal(ctx) {
                return stop;
            }

            match self.vcpu_fd.run() {
                Ok(VcpuExit::Hlt) => {
                    // Idle halt; the guest's runtime busy-waits on signals
                    // via hypercalls, so treat this like any other
                    // quiescent point and loop back to check for pause/
                    // signals rather than exiting.
                    continue;
                }
                Ok(VcpuExit::Shutdown) => {
                    return Stop::Exited(0);
                }
                Ok(VcpuExit::IoOut(port, data)) if port >= KM_HCALL_PORT_BASE => {
                    let syscall_nr = (port - KM_HCALL_PORT_BASE) as u64;
                    let args_gva = decode_io_out_data(data);
                    match self.dispatch_hypercall(ctx, syscall_nr, args_gva) {
                        HcallOutcome::Continue => {}
                        HcallOutcome::Halt(code) => {
                            ctx.machine.request_exit(code);
                            return Stop::Exited(code);
                        }
                        HcallOutcome::InvalidHypercall => {
                            tracing::warn!(syscall_nr, "invalid hypercall: unmapped argument block");
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(?other, "unhandled vm-exit");
                }
                Err(e) if e.errno() == libc::EINTR => {
                    // SIGVCPUSTOP (or any other signal) broke us out of
                    // KVM_RUN; loop back around to the pause/signal checks.
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "vcpu run failed");
                    ctx.machine.request_exit(-1);
                    return Stop::Exited(-1);
                }
            }
        }
    }

    /// Pre-intercepts the syscalls that need state `hypercall::dispatch`
    /// deliberately doesn't carry (`VmFd` for the memory manager, the
    /// signal engine and this vCPU's own state for signal calls), then
    /// falls through to the generic table for everything else.
    fn dispatch_hypercall(&mut self, ctx: &RunContext, syscall_nr: u64, args_gva: u64) -> HcallOutcome {
        let args_host = match ctx.memory.gva_to_kma(args_gva) {
            Some(addr) => addr as *mut HcArgs,
            None => return HcallOutcome::InvalidHypercall,
        };
        let args = unsafe { &mut *args_host };

        let memory_result = match syscall_nr {
            n if n == libc::SYS_brk as u64 => {
                Some(ctx.memory.set_brk(ctx.vm_fd, args.arg1))
            }
            n if n == crate::hypercall::HC_TBRK as u64 => {
                Some(ctx.memory.set_tbrk(ctx.vm_fd, args.arg1))
            }
            n if n == libc::SYS_mmap as u64 => {
                Some(ctx.memory.mmap(ctx.vm_fd, args.arg1, args.arg2, args.arg3 as i32))
            }
            _ => None,
        };
        if let Some(result) = memory_result {
            match result {
                Ok(v) => args.hc_ret = v,
                Err(e) => {
                    tracing::warn!(error = %e, syscall_nr, "memory hypercall failed");
                    args.hc_ret = (-(libc::ENOMEM as i64)) as u64;
                }
            }
            return HcallOutcome::Continue;
        }

        match syscall_nr {
            n if n == libc::SYS_munmap as u64 => {
                args.hc_ret = match ctx.memory.munmap(args.arg1, args.arg2) {
                    Ok(()) => 0,
                    Err(_) => (-(libc::EINVAL as i64)) as u64,
                };
                HcallOutcome::Continue
            }
            n if n == libc::SYS_mprotect as u64 => {
                args.hc_ret = match ctx.memory.mprotect(args.arg1, args.arg2, args.arg3 as i32) {
                    Ok(()) => 0,
                    Err(_) => (-(libc::EINVAL as i64)) as u64,
                };
                HcallOutcome::Continue
            }
            n if n == libc::SYS_madvise as u64 || n == libc::SYS_msync as u64 => {
                // No monitor-side bookkeeping change: advice hints and
                // msync flushes are no-ops against an already-resident,
                // anonymous-backed guest mapping.
                args.hc_ret = 0;
                HcallOutcome::Continue
            }
            n if n == libc::SYS_mremap as u64 => {
                // mremap is expressed as munmap-old + mmap-new against the
                // monitor's region list; MAP_FIXED moves aren't supported.
                let _ = ctx.memory.munmap(args.arg1, args.arg2);
                args.hc_ret = match ctx.memory.mmap(ctx.vm_fd, 0, args.arg3, libc::PROT_READ | libc::PROT_WRITE) {
                    Ok(gva) => gva,
                    Err(_) => (-(libc::ENOMEM as i64)) as u64,
                };
                HcallOutcome::Continue
            }
            n if n == libc::SYS_rt_sigaction as u64 => {
                self.sigaction_hcall(ctx, args);
                HcallOutcome::Continue
            }
            n if n == libc::SYS_rt_sigprocmask as u64 => {
                self.sigprocmask_hcall(args);
                HcallOutcome::Continue
            }
            n if n == libc::SYS_rt_sigpending as u64 => {
                self.sigpending_hcall(ctx, args);
                HcallOutcome::Continue
            }
            n if n == libc::SYS_kill as u64 => {
                self.kill_hcall(ctx, args);
                HcallOutcome::Continue
            }
            n if n == libc::SYS_tkill as u64 => {
                self.tkill_hcall(ctx, args);
                HcallOutcome::Continue
            }
            n if n == libc::SYS_rt_sigreturn as u64 => {
                self.sigreturn_hcall(ctx, args_gva);
                HcallOutcome::Continue
            }
            _ => hypercall::dispatch(ctx.memory, ctx.net, syscall_nr, args_gva),
        }
    }

    fn sigaction_hcall(&self, ctx: &RunContext, args: &mut HcArgs) {
        let signo = args.arg1 as i32;
        let new = if args.arg2 != 0 {
            let host = ctx.memory.gva_to_kma_nocheck(args.arg2);
            Some(unsafe { *(host as *const signal::SigAction) })
        } else {
            None
        };
        match ctx.machine.signals.sigaction(signo, new) {
            Ok(old) => {
                if args.arg3 != 0 {
                    let host = ctx.memory.gva_to_kma_nocheck(args.arg3);
                    unsafe { std::ptr::write_unaligned(host as *mut signal::SigAction, old) };
                }
                args.hc_ret = 0;
            }
            Err(errno) => args.hc_ret = errno as u64,
        }
    }

    fn sigprocmask_hcall(&self, args: &mut HcArgs) {
        let how = args.arg1 as i32;
        let mut guard = self.state.signals.lock().unwrap();
        let set = if args.arg2 != 0 {
            Some(SigSet(args.arg2))
        } else {
            None
        };
        let old = signal::SignalEngine::sigprocmask(&mut guard, how, set);
        if args.arg3 != 0 {
            args.hc_ret = old.0;
        } else {
            args.hc_ret = 0;
        }
    }

    fn sigpending_hcall(&self, ctx: &RunContext, args: &mut HcArgs) {
        let mut guard = self.state.signals.lock().unwrap();
        let pending = ctx.machine.signals.pending_set(&guard);
        args.hc_ret = pending.0 & guard.mask.0;
    }

    fn kill_hcall(&self, ctx: &RunContext, args: &mut HcArgs) {
        let signo = args.arg2 as i32;
        ctx.machine.signals.post_signal(
            None,
            SigInfo {
                si_signo: signo,
                si_code: SI_USER,
            },
        );
        ctx.machine.vcpu_apply_all(|v| nudge(v));
        args.hc_ret = 0;
    }

    fn tkill_hcall(&self, ctx: &RunContext, args: &mut HcArgs) {
        let target_tid = args.arg1;
        let signo = args.arg2 as i32;
        let mut found = false;
        for v in ctx.machine.vcpus.lock().unwrap().iter() {
            if v.id == target_tid {
                let mut guard = v.signals.lock().unwrap();
                ctx.machine.signals.post_signal(
                    Some(&mut guard),
                    SigInfo {
                        si_signo: signo,
                        si_code: SI_USER,
                    },
                );
                drop(guard);
                nudge(v);
                found = true;
                break;
            }
        }
        args.hc_ret = if found { 0 } else { (-(libc::ESRCH as i64)) as u64 };
    }

    /// The guest trampoline hypercalls here after the handler returns;
    /// restore the saved register file and pre-handler mask from the frame
    /// it had built. `args_gva` is the frame's `hc_ret` field address,
    /// i.e. `frame_gva + 8` (see `signal::SignalFrame`'s layout doc).
    fn sigreturn_hcall(&mut self, ctx: &RunContext, args_gva: u64) {
        let frame_gva = args_gva.wrapping_sub(8);
        let host = match ctx.memory.gva_to_kma(frame_gva) {
            Some(h) => h,
            None => return,
        };
        let frame = unsafe { &*(host as *const signal::SignalFrame) };
        let _ = self.vcpu_fd.set_regs(&frame.regs);
        let mut guard = self.state.signals.lock().unwrap();
        guard.mask = frame.saved_mask;
    }

    /// Checks for a deliverable signal and either builds a guest handler
    /// frame (resuming into the handler) or reports a fatal termination to
    /// the caller, which must pause siblings, optionally core-dump, and
    /// exit with `signo`.
    fn service_pending_signal(&mut self, ctx: &RunContext) -> Option<Stop> {
        let mut guard = self.state.signals.lock().unwrap();
        let (info, act) = ctx.machine.signals.deliver(&mut guard)?;
        if act.handler == signal::SIG_DFL {
            let core = ctx.machine.signals.is_program_error(info.si_signo) || info.si_signo == libc::SIGQUIT;
            return Some(Stop::Killed {
                signo: info.si_signo,
                core,
            });
        }
        let current_regs = match self.vcpu_fd.get_regs() {
            Ok(r) => r,
            Err(_) => return None,
        };
        let (frame_gva, frame, new_regs, new_mask) =
            signal::build_guest_handler_frame(&current_regs, guard.mask, info, &act, ctx.sigreturn_trampoline);
        guard.mask = new_mask;
        drop(guard);

        if let Some(host) = ctx.memory.gva_to_kma(frame_gva) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &frame as *const signal::SignalFrame as *const u8,
                    host as *mut u8,
                    std::mem::size_of::<signal::SignalFrame>(),
                );
            }
            let _ = self.vcpu_fd.set_regs(&new_regs);
        }
        None
    }
}

/// Reads the `u32` an `outl` wrote, zero-extended, mirroring the original
/// guest runtime's `km_hcall` casting its 64-bit argument pointer down to
/// `uint32_t` for the port write (`examples/original_source/include/
/// km_hcalls.h`) — argument blocks must live below the 4 GiB mark.
pub fn decode_io_out_data(data: &[u8]) -> u64 {
    let mut raw = [0u8; 4];
    let n = data.len().min(4);
    raw[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(raw) as u64
}
