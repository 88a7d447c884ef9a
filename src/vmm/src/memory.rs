// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest physical memory management: the exponential memory-slot geometry,
//! brk/tbrk watermarks, and the mmap family of operations layered on top of
//! the slots as finer-grained, bookkeeping-only "regions".
//!
//! The geometry math mirrors the original monitor's `km_mem.h` closely
//! enough that the comments there (region size doubling to work around slow
//! KVM memory-region insertion) still apply verbatim.

use std::convert::TryFrom;
use std::sync::RwLock;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;

pub const KM_PAGE_SIZE: u64 = 0x1000;
const KIB: u64 = 0x400;
const MIB: u64 = 0x100000;
const GIB: u64 = MIB * KIB;

/// Reserved slot holding the low 32 pages the monitor uses for the GDT/IDT
/// and identity page tables.
pub const KM_RSRV_MEMSLOT: usize = 0;
/// Reserved slot backing the guest's vvar/vDSO pages.
pub const KM_RSRV_VDSOSLOT: usize = 41;
/// Reserved slot backing the guest unikernel helper pages.
pub const KM_RSRV_KMGUESTMEM_SLOT: usize = 42;

pub const GUEST_MEM_START_VA: u64 = 2 * MIB;
pub const GUEST_PRIVATE_MEM_START_VA: u64 = 512 * GIB;
pub const GUEST_MEM_TOP_VA: u64 = 512 * GIB - GUEST_MEM_START_VA;
pub const GUEST_VVAR_VDSO_BASE_VA: u64 = GUEST_PRIVATE_MEM_START_VA;
pub const GUEST_KMGUESTMEM_BASE_VA: u64 = GUEST_PRIVATE_MEM_START_VA + 32 * KIB;
pub const GUEST_MAX_PHYSMEM_SUPPORTED: u64 = 512 * GIB;
const KM_VVAR_VDSO_SIZE: u64 = 2 * KM_PAGE_SIZE;

/// `gva = pva + GUEST_VA_OFFSET` in the high zone, given the machine's
/// configured `guest_max_physmem`.
fn guest_va_offset(guest_max_physmem: u64) -> u64 {
    GUEST_MEM_TOP_VA + GUEST_MEM_START_VA - guest_max_physmem
}

/// Index of the exponential memory region covering `addr`, valid only in the
/// lower (growing) half of the address space. `addr` must be nonzero.
///
/// Mirrors `MEM_IDX()`: `43 - clz(addr)`, where 43 = `64 - clz(2MiB)`.
pub fn mem_idx(addr: u64) -> u32 {
    debug_assert!(addr > 0);
    43 - addr.leading_zeros()
}

pub fn gva_to_gpa_nocheck(gva: u64, guest_max_physmem: u64) -> u64 {
    let offset = guest_va_offset(guest_max_physmem);
    if gva > offset {
        gva - offset
    } else {
        gva
    }
}

pub fn gpa_to_upper_gva(gpa: u64, guest_max_physmem: u64) -> u64 {
    gpa + guest_va_offset(guest_max_physmem)
}

fn memreg_base(idx: u32, mid_mem_idx: u32, last_mem_idx: u32, guest_max_physmem: u64) -> u64 {
    if idx <= mid_mem_idx {
        MIB << idx
    } else {
        guest_max_physmem - memreg_top(last_mem_idx - idx, mid_mem_idx, last_mem_idx, guest_max_physmem)
    }
}

fn memreg_top(idx: u32, mid_mem_idx: u32, last_mem_idx: u32, guest_max_physmem: u64) -> u64 {
    if idx <= mid_mem_idx {
        (MIB << 1) << idx
    } else {
        guest_max_physmem - memreg_base(last_mem_idx - idx, mid_mem_idx, last_mem_idx, guest_max_physmem)
    }
}

fn memreg_size(idx: u32, mid_mem_idx: u32, last_mem_idx: u32) -> u64 {
    if idx <= mid_mem_idx {
        MIB << idx
    } else {
        MIB << (last_mem_idx - idx)
    }
}

fn km_vdso_gva(gva: u64) -> bool {
    gva >= GUEST_VVAR_VDSO_BASE_VA && gva < GUEST_VVAR_VDSO_BASE_VA + KM_VVAR_VDSO_SIZE
}

fn km_guestmem_gva(gva: u64, guestmem_size: u64) -> bool {
    gva >= GUEST_KMGUESTMEM_BASE_VA && gva < GUEST_KMGUESTMEM_BASE_VA + guestmem_size
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no room left to grow guest physical memory")]
    OutOfSlots,
    #[error("error issuing an ioctl to KVM")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    #[error("host mmap/mprotect/munmap failed: {0}")]
    Host(#[source] std::io::Error),
    #[error("guest address {0:#x} is not mapped or not accessible with the requested protection")]
    InvalidGuestAddress(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous range of guest physical memory backed by host memory and
/// registered with the hypervisor as one `kvm_userspace_memory_region`.
#[derive(Debug)]
pub struct MemSlot {
    pub index: u32,
    pub base: u64,
    pub size: u64,
    pub host_addr: *mut u8,
}

// Slots own an mmap'd host mapping for the lifetime of the VM; sharing the
// raw pointer across vCPU threads is safe because each slot's byte range is
// only ever mutated through the monitor's own translation/validation paths.
unsafe impl Send for MemSlot {}
unsafe impl Sync for MemSlot {}

/// Bookkeeping-only sub-range of a slot, analogous to a Linux VMA. Regions
/// are what `mmap`/`munmap`/`mprotect` actually manipulate; they get merged
/// with compatible neighbors unless `recovery_mode` is set.
#[derive(Debug, Clone)]
pub struct Region {
    pub base: u64,
    pub limit: u64,
    pub prot: i32,
    pub filename: Option<String>,
}

struct Inner {
    slots: Vec<MemSlot>,
    regions: Vec<Region>,
    brk: u64,
    tbrk: u64,
    guest_max_physmem: u64,
    guest_mid_physmem: u64,
    last_mem_idx: u32,
    mid_mem_idx: u32,
    recovery_mode: bool,
}

/// The guest's memory manager: geometry, brk/tbrk, and the region list.
/// Guarded by a single `RwLock` so slot setup stays single-writer-at-a-time.
pub struct Memory {
    inner: RwLock<Inner>,
}

impl Memory {
    pub fn new(guest_max_physmem: u64) -> Self {
        let last_mem_idx = mem_idx(guest_max_physmem - 1);
        let mid_mem_idx = last_mem_idx / 2;
        Memory {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                regions: Vec::new(),
                brk: GUEST_MEM_START_VA,
                tbrk: guest_max_physmem,
                guest_max_physmem,
                guest_mid_physmem: MIB << mid_mem_idx,
                last_mem_idx,
                mid_mem_idx,
                recovery_mode: false,
            }),
        }
    }

    pub fn set_recovery_mode(&self, enabled: bool) {
        self.inner.write().unwrap().recovery_mode = enabled;
    }

    pub fn brk(&self) -> u64 {
        self.inner.read().unwrap().brk
    }

    pub fn tbrk(&self) -> u64 {
        self.inner.read().unwrap().tbrk
    }

    fn region_idx(&self, gva: u64, guard: &Inner) -> u32 {
        let gpa = gva_to_gpa_nocheck(gva, guard.guest_max_physmem);
        if gpa > guard.guest_mid_physmem {
            guard.last_mem_idx - mem_idx(guard.guest_max_physmem - gpa - 1)
        } else {
            mem_idx(gpa)
        }
    }

    /// Ensures slots exist to cover `[0, up_to)` in the lower zone (or the
    /// symmetric upper-zone range when `upper` is true), allocating new
    /// slots and registering them with `vm_fd` as needed.
    fn ensure_slots_cover(&self, vm_fd: &VmFd, up_to_idx: u32, guard: &mut Inner) -> Result<()> {
        while guard.slots.len() <= up_to_idx as usize {
            let idx = guard.slots.len() as u32;
            let base = memreg_base(idx, guard.mid_mem_idx, guard.last_mem_idx, guard.guest_max_physmem);
            let size = memreg_size(idx, guard.mid_mem_idx, guard.last_mem_idx);
            let host_addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if host_addr == libc::MAP_FAILED {
                return Err(Error::Host(std::io::Error::last_os_error()));
            }
            let region = kvm_userspace_memory_region {
                slot: idx,
                guest_phys_addr: base,
                memory_size: size,
                userspace_addr: host_addr as u64,
                flags: 0,
            };
            unsafe { vm_fd.set_user_memory_region(region) }.map_err(Error::KvmIoctl)?;
            guard.slots.push(MemSlot {
                index: idx,
                base,
                size,
                host_addr: host_addr as *mut u8,
            });
        }
        Ok(())
    }

    /// Grows or shrinks the lower data region. Returns the resulting brk.
    pub fn set_brk(&self, vm_fd: &VmFd, requested: u64) -> Result<u64> {
        let mut guard = self.inner.write().unwrap();
        if requested == 0 {
            return Ok(guard.brk);
        }
        let new_brk = (requested + KM_PAGE_SIZE - 1) & !(KM_PAGE_SIZE - 1);
        if new_brk >= guard.tbrk {
            return Ok(guard.brk);
        }
        if new_brk > guard.brk {
            let idx = self.region_idx(new_brk.saturating_sub(1).max(1), &guard);
            self.ensure_slots_cover(vm_fd, idx, &mut guard)?;
        }
        let old_brk = guard.brk;
        guard.brk = new_brk;
        if new_brk > old_brk {
            let recovery = guard.recovery_mode;
            push_region(&mut guard.regions, old_brk, new_brk, libc::PROT_READ | libc::PROT_WRITE, None, recovery);
        } else {
            shrink_regions_to(&mut guard.regions, new_brk, u64::MAX, true);
        }
        Ok(guard.brk)
    }

    /// Symmetric to `set_brk`, growing or shrinking the upper (downward
    /// growing) region.
    pub fn set_tbrk(&self, vm_fd: &VmFd, requested: u64) -> Result<u64> {
        let mut guard = self.inner.write().unwrap();
        if requested == 0 {
            return Ok(guard.tbrk);
        }
        let new_tbrk = requested & !(KM_PAGE_SIZE - 1);
        if new_tbrk <= guard.brk {
            return Ok(guard.tbrk);
        }
        if new_tbrk < guard.tbrk {
            let idx = self.region_idx(new_tbrk, &guard);
            self.ensure_slots_cover(vm_fd, idx, &mut guard)?;
        }
        let old_tbrk = guard.tbrk;
        guard.tbrk = new_tbrk;
        if new_tbrk < old_tbrk {
            let recovery = guard.recovery_mode;
            push_region(&mut guard.regions, new_tbrk, old_tbrk, libc::PROT_READ | libc::PROT_WRITE, None, recovery);
        } else {
            shrink_regions_to(&mut guard.regions, 0, new_tbrk, false);
        }
        Ok(guard.tbrk)
    }

    /// Registers the monitor's two private overlays (vvar/vDSO and the
    /// unikernel helper pages) in their reserved slots.
    pub fn monitor_pages_in_guest(&self, vm_fd: &VmFd, slot_idx: usize, size: u64) -> Result<u64> {
        let mut guard = self.inner.write().unwrap();
        while guard.slots.len() <= slot_idx {
            guard.slots.push(MemSlot {
                index: guard.slots.len() as u32,
                base: 0,
                size: 0,
                host_addr: std::ptr::null_mut(),
            });
        }
        let host_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if host_addr == libc::MAP_FAILED {
            return Err(Error::Host(std::io::Error::last_os_error()));
        }
        let region = kvm_userspace_memory_region {
            slot: u32::try_from(slot_idx).unwrap(),
            guest_phys_addr: 0,
            memory_size: size,
            userspace_addr: host_addr as u64,
            flags: 0,
        };
        unsafe { vm_fd.set_user_memory_region(region) }.map_err(Error::KvmIoctl)?;
        guard.slots[slot_idx] = MemSlot {
            index: slot_idx as u32,
            base: 0,
            size,
            host_addr: host_addr as *mut u8,
        };
        Ok(host_addr as u64)
    }

    fn vdso_host_base(&self, guard: &Inner) -> u64 {
        guard.slots[KM_RSRV_VDSOSLOT].host_addr as u64
    }

    fn guestmem_host_base(&self, guard: &Inner) -> u64 {
        guard.slots[KM_RSRV_KMGUESTMEM_SLOT].host_addr as u64
    }

    fn guestmem_size(&self, guard: &Inner) -> u64 {
        guard.slots[KM_RSRV_KMGUESTMEM_SLOT].size
    }

    /// Finds the slot covering guest physical address `gpa` and returns the
    /// corresponding host address. Excludes the two private overlay slots,
    /// which use `guest_phys_addr = 0` as a KVM registration placeholder and
    /// are only ever reached through their own VA windows above.
    fn resolve_host(&self, gpa: u64, guard: &Inner) -> Option<u64> {
        guard
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != KM_RSRV_VDSOSLOT && *i != KM_RSRV_KMGUESTMEM_SLOT && s.size > 0)
            .find(|(_, s)| gpa >= s.base && gpa < s.base + s.size)
            .map(|(_, s)| s.host_addr as u64 + (gpa - s.base))
    }

    /// Translates an address reserved for monitor-internal scratch use (GDT,
    /// page tables) living below `GUEST_MEM_START_VA`, in the always-present
    /// slot 0. Callers must have called [`Memory::ensure_scratch_slot`] first.
    pub fn scratch_host_ptr(&self, gpa: u64) -> Option<u64> {
        let guard = self.inner.read().unwrap();
        self.resolve_host(gpa, &guard)
    }

    /// Guarantees slot 0 — the monitor's low scratch region below
    /// `GUEST_MEM_START_VA` — is registered with KVM, independent of any
    /// brk/tbrk/mmap activity having happened yet.
    pub fn ensure_scratch_slot(&self, vm_fd: &VmFd) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        self.ensure_slots_cover(vm_fd, 0, &mut guard)
    }

    /// Translates a guest virtual address assumed already valid.
    pub fn gva_to_kma_nocheck(&self, gva: u64) -> u64 {
        let guard = self.inner.read().unwrap();
        if km_vdso_gva(gva) {
            return self.vdso_host_base(&guard) + (gva - GUEST_VVAR_VDSO_BASE_VA);
        }
        if guard.slots.len() > KM_RSRV_KMGUESTMEM_SLOT
            && km_guestmem_gva(gva, self.guestmem_size(&guard))
        {
            return self.guestmem_host_base(&guard) + (gva - GUEST_KMGUESTMEM_BASE_VA);
        }
        let gpa = gva_to_gpa_nocheck(gva, guard.guest_max_physmem);
        self.resolve_host(gpa, &guard).unwrap_or(gpa)
    }

    /// Translates a guest virtual address, returning `None` for any address
    /// that falls in the "hole" between `brk` and `tbrk`, outside the legal
    /// zones, or that is otherwise not backed by guest memory.
    pub fn gva_to_kma(&self, gva: u64) -> Option<u64> {
        let guard = self.inner.read().unwrap();
        if gva < GUEST_MEM_START_VA || gva >= GUEST_MEM_TOP_VA {
            return None;
        }
        let brk_page = (guard.brk + KM_PAGE_SIZE - 1) & !(KM_PAGE_SIZE - 1);
        let tbrk_page = guard.tbrk & !(KM_PAGE_SIZE - 1);
        let in_hole = brk_page <= gva && gva < tbrk_page;
        let in_vdso = km_vdso_gva(gva);
        let in_guestmem = guard.slots.len() > KM_RSRV_KMGUESTMEM_SLOT
            && km_guestmem_gva(gva, self.guestmem_size(&guard));
        if in_hole && !in_vdso && !in_guestmem {
            return None;
        }
        drop(guard);
        Some(self.gva_to_kma_nocheck(gva))
    }

    /// Page-granular validity + protection walk.
    pub fn is_gva_accessible(&self, gva: u64, size: u64, prot: i32) -> bool {
        let mut addr = gva & !(KM_PAGE_SIZE - 1);
        let end = gva + size;
        let guard = self.inner.read().unwrap();
        let wanted = protection_adjust(prot);
        while addr < end {
            match guard
                .regions
                .iter()
                .find(|r| r.base <= addr && addr < r.limit)
            {
                Some(r) if protection_adjust(r.prot) & wanted == wanted => {}
                _ => return false,
            }
            addr += KM_PAGE_SIZE;
        }
        true
    }

    /// Maps `len` bytes of guest memory, honoring `MAP_FIXED` via `addr`
    /// when nonzero; otherwise allocates downward from the current `tbrk`.
    pub fn mmap(&self, vm_fd: &VmFd, addr: u64, len: u64, prot: i32) -> Result<u64> {
        let len = (len + KM_PAGE_SIZE - 1) & !(KM_PAGE_SIZE - 1);
        let gva = if addr != 0 {
            addr
        } else {
            let new_tbrk = self.set_tbrk(vm_fd, self.tbrk() - len)?;
            new_tbrk
        };
        if self.gva_to_kma(gva).is_none() {
            return Err(Error::InvalidGuestAddress(gva));
        }
        let mut guard = self.inner.write().unwrap();
        let recovery = guard.recovery_mode;
        push_region(&mut guard.regions, gva, gva + len, prot, None, recovery);
        Ok(gva)
    }

    pub fn munmap(&self, addr: u64, len: u64) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        shrink_regions_to(&mut guard.regions, addr, addr + len, true);
        Ok(())
    }

    pub fn mprotect(&self, addr: u64, len: u64, prot: i32) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        for r in guard.regions.iter_mut() {
            if r.base < addr + len && addr < r.limit {
                r.prot = protection_adjust(prot);
            }
        }
        Ok(())
    }

    pub fn set_region_filename(&self, base: u64, limit: u64, filename: String) {
        let mut guard = self.inner.write().unwrap();
        for r in guard.regions.iter_mut() {
            if r.base == base && r.limit == limit {
                r.filename = Some(filename.clone());
            }
        }
    }

    pub fn regions_snapshot(&self) -> Vec<Region> {
        self.inner.read().unwrap().regions.clone()
    }

    pub fn guest_max_physmem(&self) -> u64 {
        self.inner.read().unwrap().guest_max_physmem
    }
}

fn protection_adjust(prot: i32) -> i32 {
    if prot & libc::PROT_WRITE != 0 {
        prot | libc::PROT_READ
    } else {
        prot
    }
}

fn push_region(
    regions: &mut Vec<Region>,
    base: u64,
    limit: u64,
    prot: i32,
    filename: Option<String>,
    recovery_mode: bool,
) {
    if !recovery_mode {
        if let Some(last) = regions.last_mut() {
            if last.limit == base && last.prot == prot && last.filename == filename {
                last.limit = limit;
                return;
            }
        }
    }
    regions.push(Region {
        base,
        limit,
        prot: protection_adjust(prot),
        filename,
    });
}

fn shrink_regions_to(regions: &mut Vec<Region>, lo: u64, hi: u64, keep_outside: bool) {
    let mut out = Vec::with_capacity(regions.len());
    for r in regions.drain(..) {
        if !keep_outside {
            // tbrk growth: drop anything fully inside [lo, hi)
            if r.base >= lo && r.limit <= hi {
                continue;
            }
            out.push(r);
            continue;
        }
        if r.limit <= lo || r.base >= hi {
            out.push(r);
            continue;
        }
        if r.base < lo {
            out.push(Region {
                base: r.base,
                limit: lo,
                prot: r.prot,
                filename: r.filename.clone(),
            });
        }
        if r.limit > hi {
            out.push(Region {
                base: hi,
                limit: r.limit,
                prot: r.prot,
                filename: r.filename,
            });
        }
    }
    *regions = out;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_idx_matches_table() {
        assert_eq!(mem_idx(2 * MIB), 1);
        assert_eq!(mem_idx(4 * MIB), 2);
        assert_eq!(mem_idx(8 * MIB), 3);
    }

    #[test]
    fn gva_to_gpa_roundtrips_low_zone() {
        let max = GUEST_MAX_PHYSMEM_SUPPORTED;
        let gva = GUEST_MEM_START_VA + 0x1000;
        assert_eq!(gva_to_gpa_nocheck(gva, max), gva);
    }

    #[test]
    fn gva_to_gpa_shifts_high_zone() {
        let max = GUEST_MAX_PHYSMEM_SUPPORTED;
        let offset = guest_va_offset(max);
        let gva = offset + 0x2000;
        assert_eq!(gva_to_gpa_nocheck(gva, max), 0x2000);
    }

    #[test]
    fn memreg_geometry_is_symmetric() {
        let max = GUEST_MAX_PHYSMEM_SUPPORTED;
        let last = mem_idx(max - 1);
        let mid = last / 2;
        for idx in 0..=last {
            let base = memreg_base(idx, mid, last, max);
            let top = memreg_top(idx, mid, last, max);
            let size = memreg_size(idx, mid, last);
            assert_eq!(top - base, size, "idx {idx} base/top/size mismatch");
        }
    }

    #[test]
    fn protection_adjust_implies_read() {
        assert_eq!(protection_adjust(libc::PROT_WRITE), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(protection_adjust(libc::PROT_READ), libc::PROT_READ);
    }

    #[test]
    fn push_region_merges_adjacent_compatible() {
        let mut regions = Vec::new();
        push_region(&mut regions, 0x1000, 0x2000, libc::PROT_READ, None, false);
        push_region(&mut regions, 0x2000, 0x3000, libc::PROT_READ, None, false);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].base, 0x1000);
        assert_eq!(regions[0].limit, 0x3000);
    }

    #[test]
    fn push_region_does_not_merge_in_recovery_mode() {
        let mut regions = Vec::new();
        push_region(&mut regions, 0x1000, 0x2000, libc::PROT_READ, None, true);
        push_region(&mut regions, 0x2000, 0x3000, libc::PROT_READ, None, true);
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn shrink_regions_splits_hole() {
        let mut regions = vec![Region {
            base: 0x1000,
            limit: 0x4000,
            prot: libc::PROT_READ,
            filename: None,
        }];
        shrink_regions_to(&mut regions, 0x2000, 0x3000, true);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].limit, 0x2000);
        assert_eq!(regions[1].base, 0x3000);
    }
}
