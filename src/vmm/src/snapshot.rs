// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Snapshot write/restore (component E): serializes the whole guest state
//! into an ELF `ET_CORE`-compatible file and rehydrates it into a fresh
//! `Machine`/`Memory`/vCPU set. Grounded on the original's `km_snapshot.c`,
//! in particular its bit-exact `NT_PRSTATUS` register mapping and its
//! PT_LOAD-replay algorithm for restoring memory.

use std::fs;
use std::io;
use std::path::Path;

use kvm_bindings::kvm_regs;
use kvm_ioctls::VmFd;

use crate::elf::{self, note_type, Ehdr, Phdr, PT_LOAD, PT_NOTE};
use crate::loader::PayloadDescriptor;
use crate::machine::{Machine, VcpuState};
use crate::memory::{Memory, GUEST_KMGUESTMEM_BASE_VA, GUEST_VVAR_VDSO_BASE_VA};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot file is not a valid ET_CORE ELF image")]
    InvalidFormat,
    #[error("memory error during restore")]
    Memory(#[from] crate::memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed register order `NT_PRSTATUS` notes are written/read in. This
/// ordering is copied verbatim from `km_ss_recover_prstatus`: it must stay
/// bit-exact across versions of this monitor, since a snapshot taken by one
/// build must restore cleanly in another.
struct Prstatus {
    regs: [u64; 18],
    cs_base: u64,
    fs_base: u64,
    gs_base: u64,
    ds_base: u64,
    es_base: u64,
}

fn regs_to_prstatus(regs: &kvm_regs, seg_bases: [u64; 5]) -> Prstatus {
    Prstatus {
        regs: [
            regs.r15, regs.r14, regs.r13, regs.r12, regs.rbp, regs.rbx, regs.r11, regs.r10,
            regs.r9, regs.r8, regs.rax, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rax,
            regs.rip, regs.rflags,
        ],
        cs_base: seg_bases[0],
        fs_base: seg_bases[1],
        gs_base: seg_bases[2],
        ds_base: seg_bases[3],
        es_base: seg_bases[4],
    }
}

fn prstatus_to_regs(p: &Prstatus) -> kvm_regs {
    let mut regs = kvm_regs::default();
    regs.r15 = p.regs[0];
    regs.r14 = p.regs[1];
    regs.r13 = p.regs[2];
    regs.r12 = p.regs[3];
    regs.rbp = p.regs[4];
    regs.rbx = p.regs[5];
    regs.r11 = p.regs[6];
    regs.r10 = p.regs[7];
    regs.r9 = p.regs[8];
    regs.r8 = p.regs[9];
    regs.rax = p.regs[10];
    regs.rcx = p.regs[11];
    regs.rdx = p.regs[12];
    regs.rsi = p.regs[13];
    regs.rdi = p.regs[14];
    regs.rip = p.regs[16];
    regs.rflags = p.regs[17];
    regs
}

/// A single vCPU's monitor-side state, serialized as `NT_KM_VCPU`.
pub struct VcpuNote {
    pub vcpu_id: u64,
    pub stack_top: u64,
    pub guest_thr: u64,
    pub set_child_tid: u64,
    pub clear_child_tid: u64,
    pub on_sigaltstack: u64,
    pub altstack_sp: u64,
    pub altstack_flags: u64,
    pub altstack_size: u64,
    pub mapself_base: u64,
    pub mapself_size: u64,
}

fn vcpu_note_bytes(n: &VcpuNote) -> Vec<u8> {
    let mut v = Vec::with_capacity(11 * 8);
    for field in [
        n.vcpu_id,
        n.stack_top,
        n.guest_thr,
        n.set_child_tid,
        n.clear_child_tid,
        n.on_sigaltstack,
        n.altstack_sp,
        n.altstack_flags,
        n.altstack_size,
        n.mapself_base,
        n.mapself_size,
    ] {
        v.extend_from_slice(&field.to_le_bytes());
    }
    v
}

fn vcpu_note_from_bytes(b: &[u8]) -> Option<VcpuNote> {
    if b.len() < 11 * 8 {
        return None;
    }
    let field = |i: usize| elf::u64_at(b, i * 8).unwrap();
    Some(VcpuNote {
        vcpu_id: field(0),
        stack_top: field(1),
        guest_thr: field(2),
        set_child_tid: field(3),
        clear_child_tid: field(4),
        on_sigaltstack: field(5),
        altstack_sp: field(6),
        altstack_flags: field(7),
        altstack_size: field(8),
        mapself_base: field(9),
        mapself_size: field(10),
    })
}

/// A file-mapping entry as recorded in `NT_FILE`: `(base, limit, pagenum)`
/// triples followed by NUL-terminated filenames, upper-zone regions only.
struct FileNote {
    base: u64,
    limit: u64,
    filename: String,
}

fn build_file_note(pagesz: u64, entries: &[FileNote]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    out.extend_from_slice(&pagesz.to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.base.to_le_bytes());
        out.extend_from_slice(&e.limit.to_le_bytes());
        out.extend_from_slice(&((e.limit - e.base) / pagesz).to_le_bytes());
    }
    for e in entries {
        out.extend_from_slice(e.filename.as_bytes());
        out.push(0);
    }
    out
}

fn parse_file_note(desc: &[u8]) -> Vec<FileNote> {
    let nfile = elf::u64_at(desc, 0).unwrap_or(0) as usize;
    let pagesz = elf::u64_at(desc, 8).unwrap_or(4096);
    let mut triples = Vec::with_capacity(nfile);
    let mut off = 16;
    for _ in 0..nfile {
        let base = elf::u64_at(desc, off).unwrap_or(0);
        let limit = elf::u64_at(desc, off + 8).unwrap_or(0);
        triples.push((base, limit));
        off += 24;
    }
    let mut names_buf = &desc[off..];
    let mut result = Vec::with_capacity(nfile);
    for (base, limit) in triples {
        let nul = names_buf.iter().position(|&b| b == 0).unwrap_or(names_buf.len());
        let filename = String::from_utf8_lossy(&names_buf[..nul]).into_owned();
        names_buf = &names_buf[(nul + 1).min(names_buf.len())..];
        result.push(FileNote { base, limit, filename });
    }
    let _ = pagesz;
    result
}

fn payload_note_bytes(p: &PayloadDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&p.load_adjust.to_le_bytes());
    out.extend_from_slice(unsafe { elf::as_bytes(&p.ehdr) });
    for phdr in &p.phdrs {
        out.extend_from_slice(unsafe { elf::as_bytes(phdr) });
    }
    out.extend_from_slice(p.filename.as_bytes());
    out.push(0);
    out
}

fn payload_note_from_bytes(desc: &[u8]) -> Option<PayloadDescriptor> {
    let load_adjust = elf::u64_at(desc, 0)?;
    let ehdr: Ehdr = elf::ehdr_from_slice(&desc[8..])?;
    let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
    let phoff = 8 + std::mem::size_of::<Ehdr>();
    for i in 0..ehdr.e_phnum as usize {
        let start = phoff + i * std::mem::size_of::<Phdr>();
        let phdr: Phdr = unsafe { elf::from_bytes(&desc[start..]) }?;
        phdrs.push(phdr);
    }
    let name_start = phoff + ehdr.e_phnum as usize * std::mem::size_of::<Phdr>();
    let name_bytes = &desc[name_start..];
    let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let filename = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
    Some(PayloadDescriptor {
        ehdr,
        phdrs,
        load_adjust,
        filename,
    })
}

/// Everything the writer needs: a paused machine, its memory manager, and
/// the loaded payload descriptors.
pub struct SnapshotSource<'a> {
    pub machine: &'a Machine,
    pub memory: &'a Memory,
    pub vcpu_regs: &'a [(kvm_regs, [u64; 5])],
    pub main: &'a PayloadDescriptor,
    pub interp: Option<&'a PayloadDescriptor>,
}

/// Writes an ELF core-dump-compatible snapshot to `path`. All vCPUs must
/// already be paused by the caller (SPEC_FULL.md §4.E).
pub fn write_snapshot(src: &SnapshotSource, path: &Path) -> Result<()> {
    let regions = src.memory.regions_snapshot();
    let covered: Vec<_> = regions
        .iter()
        .filter(|r| {
            !(r.base >= GUEST_VVAR_VDSO_BASE_VA && r.base < GUEST_KMGUESTMEM_BASE_VA + (1 << 20))
        })
        .collect();

    let mut phdrs = Vec::with_capacity(covered.len() + 1);
    let mut data = Vec::new();
    let header_reserve = std::mem::size_of::<Ehdr>()
        + (covered.len() + 1) * std::mem::size_of::<Phdr>();
    let mut file_off = header_reserve as u64;

    for r in &covered {
        let size = r.limit - r.base;
        let host = src.memory.gva_to_kma_nocheck(r.base);
        let bytes = unsafe { std::slice::from_raw_parts(host as *const u8, size as usize) };
        phdrs.push(Phdr {
            p_type: PT_LOAD,
            p_flags: prot_to_pflags(r.prot),
            p_offset: file_off,
            p_vaddr: r.base,
            p_paddr: r.base,
            p_filesz: size,
            p_memsz: size,
            p_align: crate::memory::KM_PAGE_SIZE,
        });
        data.extend_from_slice(bytes);
        file_off += size;
    }

    let mut notes = Vec::new();
    for (regs, seg_bases) in src.vcpu_regs {
        let prstatus = regs_to_prstatus(regs, *seg_bases);
        let mut buf = Vec::new();
        for v in prstatus.regs {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [prstatus.cs_base, prstatus.fs_base, prstatus.gs_base, prstatus.ds_base, prstatus.es_base] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        elf::push_note(&mut notes, b"KM", note_type::NT_PRSTATUS, &buf);
    }
    for vcpu in src.machine.vcpus.lock().unwrap().iter() {
        use std::sync::atomic::Ordering;
        let note = VcpuNote {
            vcpu_id: vcpu.id,
            stack_top: vcpu.stack_top.load(Ordering::SeqCst),
            guest_thr: vcpu.guest_thr.load(Ordering::SeqCst),
            set_child_tid: vcpu.set_child_tid.load(Ordering::SeqCst),
            clear_child_tid: vcpu.clear_child_tid.load(Ordering::SeqCst),
            on_sigaltstack: vcpu.on_sigaltstack.load(Ordering::SeqCst) as u64,
            altstack_sp: vcpu.altstack_sp.load(Ordering::SeqCst),
            altstack_flags: vcpu.altstack_flags.load(Ordering::SeqCst),
            altstack_size: vcpu.altstack_size.load(Ordering::SeqCst),
            mapself_base: vcpu.mapself_base.load(Ordering::SeqCst),
            mapself_size: vcpu.mapself_size.load(Ordering::SeqCst),
        };
        elf::push_note(&mut notes, b"KM", note_type::NT_KM_VCPU, &vcpu_note_bytes(&note));
    }
    let file_entries: Vec<FileNote> = regions
        .iter()
        .filter(|r| r.base >= crate::memory::GUEST_PRIVATE_MEM_START_VA || r.filename.is_some())
        .filter_map(|r| {
            r.filename.clone().map(|f| FileNote {
                base: r.base,
                limit: r.limit,
                filename: f,
            })
        })
        .collect();
    elf::push_note(
        &mut notes,
        b"KM",
        note_type::NT_FILE,
        &build_file_note(crate::memory::KM_PAGE_SIZE, &file_entries),
    );
    elf::push_note(&mut notes, b"KM", note_type::NT_KM_GUEST, &payload_note_bytes(src.main));
    if let Some(interp) = src.interp {
        elf::push_note(&mut notes, b"KM", note_type::NT_KM_DYNLINKER, &payload_note_bytes(interp));
    }

    phdrs.push(Phdr {
        p_type: PT_NOTE,
        p_flags: 0,
        p_offset: file_off,
        p_vaddr: 0,
        p_paddr: 0,
        p_filesz: notes.len() as u64,
        p_memsz: 0,
        p_align: 4,
    });
    data.extend_from_slice(&notes);

    let ehdr = Ehdr {
        e_ident: {
            let mut id = [0u8; 16];
            id[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            id[4] = 2; // ELFCLASS64
            id[5] = 1; // ELFDATA2LSB
            id[6] = 1; // EV_CURRENT
            id
        },
        e_type: elf::ET_CORE,
        e_machine: elf::EM_X86_64,
        e_version: 1,
        e_entry: 0,
        e_phoff: std::mem::size_of::<Ehdr>() as u64,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: std::mem::size_of::<Ehdr>() as u16,
        e_phentsize: std::mem::size_of::<Phdr>() as u16,
        e_phnum: phdrs.len() as u16,
        e_shentsize: 0,
        e_shnum: 0,
        e_shstrndx: 0,
    };

    let mut out = Vec::with_capacity(header_reserve + data.len());
    out.extend_from_slice(unsafe { elf::as_bytes(&ehdr) });
    for phdr in &phdrs {
        out.extend_from_slice(unsafe { elf::as_bytes(phdr) });
    }
    out.extend_from_slice(&data);

    fs::write(path, out)?;
    Ok(())
}

fn prot_to_pflags(prot: i32) -> u32 {
    let mut f = 0;
    if prot & libc::PROT_READ != 0 {
        f |= elf::PF_R;
    }
    if prot & libc::PROT_WRITE != 0 {
        f |= elf::PF_W;
    }
    if prot & libc::PROT_EXEC != 0 {
        f |= elf::PF_X;
    }
    f
}

/// The fields restored from a snapshot, handed back to the caller (which
/// owns VM/vCPU construction) to apply.
pub struct RestoredState {
    pub prstatus: Vec<kvm_regs>,
    pub vcpu_notes: Vec<VcpuNote>,
    pub main: Option<PayloadDescriptor>,
    pub interp: Option<PayloadDescriptor>,
}

/// Reads `path`, replays its `PT_LOAD` segments into `memory` (with
/// consolidation disabled for the duration, per SPEC_FULL.md §4.E), and
/// returns the notes for the caller to apply to vCPUs in the fixed order
/// `NT_PRSTATUS`, `NT_KM_VCPU`, `NT_FILE`, `NT_KM_GUEST`, `NT_KM_DYNLINKER`.
pub fn restore_snapshot(memory: &Memory, vm_fd: &VmFd, path: &Path) -> Result<RestoredState> {
    let bytes = fs::read(path)?;
    let ehdr = elf::ehdr_from_slice(&bytes).ok_or(Error::InvalidFormat)?;
    if ehdr.e_ident[0..4] != [0x7f, b'E', b'L', b'F'] || ehdr.e_type != elf::ET_CORE {
        return Err(Error::InvalidFormat);
    }
    let phdrs = elf::phdrs_from_slice(&bytes, &ehdr);

    memory.set_recovery_mode(true);

    let mut min_gva = u64::MAX;
    let mut rbrk = crate::memory::GUEST_MEM_START_VA;
    let mut rtbrk = memory.tbrk();
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        if phdr.p_vaddr >= crate::memory::GUEST_PRIVATE_MEM_START_VA {
            rtbrk = rtbrk.min(phdr.p_vaddr);
        } else {
            rbrk = rbrk.max(phdr.p_vaddr + phdr.p_memsz);
            min_gva = min_gva.min(phdr.p_vaddr);
        }
    }
    memory.set_brk(vm_fd, rbrk)?;
    memory.set_tbrk(vm_fd, rtbrk)?;

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let prot = {
            let mut p = 0;
            if phdr.p_flags & elf::PF_R != 0 {
                p |= libc::PROT_READ;
            }
            if phdr.p_flags & elf::PF_W != 0 {
                p |= libc::PROT_WRITE;
            }
            if phdr.p_flags & elf::PF_X != 0 {
                p |= libc::PROT_EXEC;
            }
            p
        };
        let aligned = phdr.p_vaddr & !(crate::memory::KM_PAGE_SIZE - 1);
        let skew = phdr.p_vaddr - aligned;
        memory.mmap(vm_fd, aligned, phdr.p_memsz + skew, prot | libc::PROT_WRITE)?;
        let host = memory
            .gva_to_kma(phdr.p_vaddr)
            .ok_or(Error::Memory(crate::memory::Error::InvalidGuestAddress(phdr.p_vaddr)))?;
        let off = phdr.p_offset as usize;
        let len = phdr.p_filesz as usize;
        if off + len <= bytes.len() {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes[off..off + len].as_ptr(), host as *mut u8, len);
            }
        }
        memory.mprotect(phdr.p_vaddr, phdr.p_memsz, prot)?;
    }

    let note_phdr = phdrs.iter().find(|p| p.p_type == PT_NOTE).ok_or(Error::InvalidFormat)?;
    let note_bytes = &bytes[note_phdr.p_offset as usize..(note_phdr.p_offset + note_phdr.p_filesz) as usize];

    let mut prstatus = Vec::new();
    let mut vcpu_notes = Vec::new();
    let mut main = None;
    let mut interp = None;
    let mut file_entries = Vec::new();

    elf::for_each_note(note_bytes, |_name, note_type, desc| match note_type {
        note_type::NT_PRSTATUS => {
            if desc.len() >= 18 * 8 {
                let field = |i: usize| elf::u64_at(desc, i * 8).unwrap();
                let mut regs = [0u64; 18];
                for (i, r) in regs.iter_mut().enumerate() {
                    *r = field(i);
                }
                prstatus.push(prstatus_to_regs(&Prstatus {
                    regs,
                    cs_base: 0,
                    fs_base: 0,
                    gs_base: 0,
                    ds_base: 0,
                    es_base: 0,
                }));
            }
        }
        note_type::NT_KM_VCPU => {
            if let Some(n) = vcpu_note_from_bytes(desc) {
                vcpu_notes.push(n);
            }
        }
        note_type::NT_FILE => {
            file_entries = parse_file_note(desc);
        }
        note_type::NT_KM_GUEST => {
            main = payload_note_from_bytes(desc);
        }
        note_type::NT_KM_DYNLINKER => {
            interp = payload_note_from_bytes(desc);
        }
        _ => {}
    });

    for entry in &file_entries {
        memory.set_region_filename(entry.base, entry.limit, entry.filename.clone());
    }

    memory.set_recovery_mode(false);

    Ok(RestoredState {
        prstatus,
        vcpu_notes,
        main,
        interp,
    })
}

/// Applies a restored `VcpuNote` onto a live `VcpuState`. Called only while
/// every vCPU is paused (during restore, before any vCPU thread has started
/// running guest code), so plain atomic stores without further
/// synchronization are sufficient.
pub fn apply_vcpu_note(state: &VcpuState, note: &VcpuNote) {
    use std::sync::atomic::Ordering;
    state.is_used.store(true, Ordering::SeqCst);
    state.stack_top.store(note.stack_top, Ordering::SeqCst);
    state.guest_thr.store(note.guest_thr, Ordering::SeqCst);
    state.set_child_tid.store(note.set_child_tid, Ordering::SeqCst);
    state.clear_child_tid.store(note.clear_child_tid, Ordering::SeqCst);
    state.on_sigaltstack.store(note.on_sigaltstack != 0, Ordering::SeqCst);
    state.altstack_sp.store(note.altstack_sp, Ordering::SeqCst);
    state.altstack_flags.store(note.altstack_flags, Ordering::SeqCst);
    state.altstack_size.store(note.altstack_size, Ordering::SeqCst);
    state.mapself_base.store(note.mapself_base, Ordering::SeqCst);
    state.mapself_size.store(note.mapself_size, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_note_roundtrips() {
        let entries = vec![
            FileNote { base: 0x1000, limit: 0x3000, filename: "a.so".into() },
            FileNote { base: 0x4000, limit: 0x5000, filename: "b.so".into() },
        ];
        let bytes = build_file_note(0x1000, &entries);
        let parsed = parse_file_note(&bytes);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].base, 0x1000);
        assert_eq!(parsed[0].filename, "a.so");
        assert_eq!(parsed[1].filename, "b.so");
    }

    #[test]
    fn vcpu_note_roundtrips() {
        let note = VcpuNote {
            vcpu_id: 3,
            stack_top: 0x1000,
            guest_thr: 0x2000,
            set_child_tid: 0,
            clear_child_tid: 0,
            on_sigaltstack: 0,
            altstack_sp: 0,
            altstack_flags: 0,
            altstack_size: 0,
            mapself_base: 0,
            mapself_size: 0,
        };
        let bytes = vcpu_note_bytes(&note);
        let back = vcpu_note_from_bytes(&bytes).unwrap();
        assert_eq!(back.vcpu_id, 3);
        assert_eq!(back.stack_top, 0x1000);
    }

    #[test]
    fn note_iteration_roundtrips_multiple_records() {
        let mut buf = Vec::new();
        elf::push_note(&mut buf, b"KM", note_type::NT_FILE, b"hello");
        elf::push_note(&mut buf, b"KM", note_type::NT_KM_GUEST, b"world!!");
        let mut seen = Vec::new();
        elf::for_each_note(&buf, |_n, t, d| seen.push((t, d.to_vec())));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, b"hello");
        assert_eq!(seen[1].1, b"world!!");
    }
}
