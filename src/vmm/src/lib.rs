// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! Top-level orchestrator: owns the KVM handles, the shared
//! `Machine`/`Memory`/`NetHelper`, the loaded payload descriptors, and the
//! management plane, and drives both the fresh-boot and the
//! restore-from-snapshot code paths.

extern crate libc;

pub mod config;
mod elf;
mod hypercall;
mod loader;
mod machine;
mod management;
mod memory;
mod net;
mod signal;
mod snapshot;
mod vcpu;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use kvm_ioctls::{Kvm, VmFd};

pub use config::VMMConfig;
use loader::PayloadDescriptor;
use machine::Machine;
use memory::Memory;
use net::NetHelper;
use vcpu::{RunContext, Stop, Vcpu};

const DEFAULT_STACK_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("memory error: {0}")]
    Memory(#[from] memory::Error),
    #[error("payload load error: {0}")]
    Loader(#[from] loader::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] snapshot::Error),
    #[error("vcpu error: {0}")]
    Vcpu(#[from] vcpu::Error),
    #[error("error issuing an ioctl to KVM")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    #[error("management plane error: {0}")]
    Management(#[source] std::io::Error),
    #[error("network helper error: {0}")]
    Net(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct SpawnedVcpu {
    id: u64,
    state: Arc<machine::VcpuState>,
    handle: JoinHandle<Stop>,
}

/// Owns every long-lived handle the running guest needs and drives its
/// lifecycle from construction through to process exit.
pub struct Vmm {
    kvm: Kvm,
    vm_fd: Arc<VmFd>,
    machine: Arc<Machine>,
    memory: Arc<Memory>,
    net: Arc<NetHelper>,
    config: VMMConfig,
    main: Option<PayloadDescriptor>,
    interp: Option<PayloadDescriptor>,
    mgmt: Option<management::ManagementPlane>,
}

impl Vmm {
    /// Opens `/dev/kvm`, creates the VM and its irqchip, and brings up the
    /// guest physical memory manager and reserved overlay slots before any
    /// vCPU exists.
    pub fn new(config: VMMConfig) -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;
        let vm_fd = kvm.create_vm().map_err(Error::KvmIoctl)?;
        vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;
        let vm_fd = Arc::new(vm_fd);

        let guest_max_physmem = memory::GUEST_MAX_PHYSMEM_SUPPORTED;
        let memory = Arc::new(Memory::new(guest_max_physmem));
        memory.ensure_scratch_slot(&vm_fd)?;
        memory.monitor_pages_in_guest(&vm_fd, memory::KM_RSRV_VDSOSLOT, memory::KM_PAGE_SIZE * 2)?;
        memory.monitor_pages_in_guest(&vm_fd, memory::KM_RSRV_KMGUESTMEM_SLOT, memory::KM_PAGE_SIZE)?;

        let net = Arc::new(match &config.net {
            Some(iface) => NetHelper::bind(iface).map_err(Error::Net)?,
            None => NetHelper::disabled(),
        });

        Ok(Vmm {
            kvm,
            vm_fd,
            machine: Arc::new(Machine::new()),
            memory,
            net,
            config,
            main: None,
            interp: None,
            mgmt: None,
        })
    }

    /// Boots the guest (fresh payload or restored snapshot per the config),
    /// starts the management plane, and blocks until every vCPU thread has
    /// exited, returning the guest's final exit status.
    pub fn run(mut self) -> Result<i32> {
        let mut vcpus = if let Some(restore_path) = self.config.restore.clone() {
            self.restore_and_spawn(&restore_path)?
        } else {
            self.boot_and_spawn()?
        };

        self.start_management_plane()?;

        let code = loop {
            if let Some(idx) = vcpus.iter().position(|v| v.handle.is_finished()) {
                let finished = vcpus.remove(idx);
                let stop = finished
                    .handle
                    .join()
                    .unwrap_or(Stop::Exited(-1));
                let (code, core) = match stop {
                    Stop::Exited(code) => (code, false),
                    Stop::Killed { signo, core } => {
                        tracing::warn!(vcpu = finished.id, signo, "vcpu killed by signal");
                        (128 + signo, core)
                    }
                };
                self.machine.request_exit(code);
                if core {
                    if let Err(e) = self.write_core_dump() {
                        tracing::warn!(error = %e, "failed to write core dump");
                    }
                }
                self.machine.vcpu_apply_all(|v| vcpu::nudge(v));
                break code;
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        for v in vcpus {
            let _ = v.handle.join();
        }
        drop(self.mgmt.take());

        Ok(code)
    }

    fn boot_and_spawn(&mut self) -> Result<Vec<SpawnedVcpu>> {
        let payload_path = self
            .config
            .payload
            .as_ref()
            .expect("builder guarantees payload is set when restore is not")
            .payload_path
            .clone();

        let load_result = loader::load_payload(&self.memory, &self.vm_fd, &payload_path)?;
        let stack_top = loader::allocate_stack(&self.memory, &self.vm_fd, DEFAULT_STACK_SIZE)?;

        self.main = Some(load_result.main);
        self.interp = load_result.interp;

        let cpuid = self
            .kvm
            .get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        let mut spawned = Vec::with_capacity(self.config.cpus as usize);
        for id in 0..self.config.cpus as u64 {
            let state = self.machine.init_vcpu(id);
            let mut cpu = Vcpu::new(&self.vm_fd, id, state.clone())?;

            if id == 0 {
                cpu.configure_cpuid_with(&cpuid)?;
                cpu.setup_page_tables_and_gdt(&self.memory)?;
                cpu.configure_sregs()?;
                cpu.configure_regs(load_result.entry, stack_top)?;
                cpu.configure_fpu()?;
                cpu.configure_lapic()?;
                state.stack_top.store(stack_top, std::sync::atomic::Ordering::SeqCst);
            } else {
                // Only vCPU 0 runs at fresh boot; the guest runtime is
                // responsible for bringing up additional vCPUs itself
                // (outside this monitor's scope, per SPEC_FULL.md's
                // thread-creation non-goal). Mark the slot unused so the
                // pause barrier doesn't wait on a thread that never starts.
                cpu.configure_cpuid_with(&cpuid)?;
                state.is_used.store(false, std::sync::atomic::Ordering::SeqCst);
                continue;
            }

            spawned.push(self.spawn_vcpu(cpu));
        }

        Ok(spawned)
    }

    fn restore_and_spawn(&mut self, path: &std::path::Path) -> Result<Vec<SpawnedVcpu>> {
        let restored = snapshot::restore_snapshot(&self.memory, &self.vm_fd, path)?;
        self.main = restored.main;
        self.interp = restored.interp;

        let cpuid = self
            .kvm
            .get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        let mut spawned = Vec::with_capacity(restored.vcpu_notes.len());
        for (idx, note) in restored.vcpu_notes.iter().enumerate() {
            let state = self.machine.init_vcpu(note.vcpu_id);
            snapshot::apply_vcpu_note(&state, note);
            let mut cpu = Vcpu::new(&self.vm_fd, note.vcpu_id, state.clone())?;
            cpu.configure_cpuid_with(&cpuid)?;
            cpu.configure_fpu()?;
            if idx == 0 {
                cpu.configure_lapic()?;
            }
            if let Some(regs) = restored.prstatus.get(idx) {
                cpu.vcpu_fd.set_regs(regs).map_err(vcpu::Error::KvmIoctl)?;
            }
            spawned.push(self.spawn_vcpu(cpu));
        }

        Ok(spawned)
    }

    fn spawn_vcpu(&self, mut cpu: Vcpu) -> SpawnedVcpu {
        let id = cpu.id;
        let state = cpu.state.clone();
        let machine = self.machine.clone();
        let memory = self.memory.clone();
        let net = self.net.clone();
        let vm_fd = self.vm_fd.clone();

        let handle = std::thread::Builder::new()
            .name(format!("vcpu{id}"))
            .spawn(move || {
                let span = tracing::info_span!("vcpu", id);
                let _enter = span.enter();
                let ctx = RunContext {
                    machine: &machine,
                    memory: &memory,
                    net: &net,
                    vm_fd: &vm_fd,
                    sigreturn_trampoline: vcpu::SIGRETURN_TRAMPOLINE_GVA,
                };
                cpu.run(&ctx)
            })
            .expect("failed to spawn vcpu thread");

        SpawnedVcpu { id, state, handle }
    }

    /// Pauses every vCPU, writes an ELF snapshot built from each vCPU's
    /// parked registers, and either resumes (live snapshot) or leaves the
    /// machine paused for the caller to subsequently exit.
    fn start_management_plane(&mut self) -> Result<()> {
        let socket_path = match self.socket_path() {
            Some(p) => p,
            None => return Ok(()),
        };

        let machine = self.machine.clone();
        let memory = self.memory.clone();
        let main = self.main.clone();
        let interp = self.interp.clone();
        let default_path = self.config.snapshot_path.clone();

        let handler: management::SnapshotHandler = Arc::new(move |ask: &management::SnapshotAsk| {
            let path = ask.path.clone().unwrap_or_else(|| default_path.clone());
            let main = match &main {
                Some(m) => m,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "no payload descriptor available to snapshot",
                    ))
                }
            };

            machine.request_pause();
            machine.vcpu_apply_all(|v| vcpu::nudge(v));
            machine.wait_for_all_to_pause();

            let vcpu_regs: Vec<_> = machine
                .vcpus
                .lock()
                .unwrap()
                .iter()
                .filter_map(|v| v.parked_regs.lock().unwrap().clone())
                .collect();

            let src = snapshot::SnapshotSource {
                machine: &machine,
                memory: &memory,
                vcpu_regs: &vcpu_regs,
                main,
                interp: interp.as_ref(),
            };
            snapshot::write_snapshot(&src, &path).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

            if ask.live {
                machine.resume();
            } else {
                machine.request_exit(0);
                machine.resume();
            }
            Ok(())
        });

        let plane = management::ManagementPlane::start(socket_path, handler).map_err(Error::Management)?;
        self.mgmt = Some(plane);
        Ok(())
    }

    fn socket_path(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.config.mgmt_socket {
            return Some(explicit.clone());
        }
        let dir = self.config.mgmt_dir.as_ref()?;
        let progname = std::env::args().next().unwrap_or_else(|| "monitor".to_string());
        Some(management::generated_socket_path(dir, &progname, std::process::id()))
    }

    /// Builds and writes a snapshot from whatever register state each vCPU
    /// last parked, used as a core dump on fatal-signal termination rather
    /// than a management-requested live snapshot.
    fn write_core_dump(&self) -> Result<()> {
        let main = match &self.main {
            Some(m) => m,
            None => return Ok(()),
        };
        let vcpu_regs: Vec<_> = self
            .machine
            .vcpus
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v.parked_regs.lock().unwrap().clone())
            .collect();
        let src = snapshot::SnapshotSource {
            machine: &self.machine,
            memory: &self.memory,
            vcpu_regs: &vcpu_regs,
            main,
            interp: self.interp.as_ref(),
        };
        let core_path = format!("core.{}", std::process::id());
        snapshot::write_snapshot(&src, std::path::Path::new(&core_path))?;
        Ok(())
    }
}
