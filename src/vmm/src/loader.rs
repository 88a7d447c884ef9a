// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Generic ELF payload loader. The guest is a user-mode ELF executable that
//! talks to the host exclusively through hypercalls, so there is no Linux
//! boot protocol to replicate. We read the ELF header directly, map each
//! `PT_LOAD` segment at its guest virtual address, and hand back an entry
//! point plus a reusable payload descriptor for the snapshot writer.

use std::fs;
use std::io;
use std::path::Path;

use kvm_ioctls::VmFd;

use crate::elf::{self, Ehdr, Phdr, ET_DYN, ET_EXEC, PF_W, PF_X, PT_INTERP, PT_LOAD};
use crate::memory::Memory;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read payload file: {0}")]
    Io(#[from] io::Error),
    #[error("not a valid little-endian x86-64 ELF executable")]
    InvalidElf,
    #[error("payload memory error")]
    Memory(#[from] crate::memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Copy of the ELF metadata needed to rebuild a `NT_KM_GUEST`/
/// `NT_KM_DYNLINKER` snapshot note.
#[derive(Clone)]
pub struct PayloadDescriptor {
    pub ehdr: Ehdr,
    pub phdrs: Vec<Phdr>,
    pub load_adjust: u64,
    pub filename: String,
}

pub struct LoadResult {
    pub entry: u64,
    pub main: PayloadDescriptor,
    pub interp: Option<PayloadDescriptor>,
}

fn parse_elf(bytes: &[u8]) -> Result<(Ehdr, Vec<Phdr>)> {
    let ehdr = elf::ehdr_from_slice(bytes).ok_or(Error::InvalidElf)?;
    if ehdr.e_ident[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(Error::InvalidElf);
    }
    if ehdr.e_machine != elf::EM_X86_64 {
        return Err(Error::InvalidElf);
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(Error::InvalidElf);
    }
    let phdrs = elf::phdrs_from_slice(bytes, &ehdr);
    Ok((ehdr, phdrs))
}

/// Load bias for position-independent (`ET_DYN`) payloads: place them at
/// the bottom of the low zone, well clear of the reserved monitor pages.
const PIE_LOAD_BIAS: u64 = crate::memory::GUEST_MEM_START_VA;

fn load_one(mem: &Memory, vm_fd: &VmFd, path: &Path) -> Result<(PayloadDescriptor, u64)> {
    let bytes = fs::read(path)?;
    let (ehdr, phdrs) = parse_elf(&bytes)?;
    let load_adjust = if ehdr.e_type == ET_DYN { PIE_LOAD_BIAS } else { 0 };

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let vaddr = phdr.p_vaddr + load_adjust;
        let mut prot = libc::PROT_NONE;
        if phdr.p_flags & elf::PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if phdr.p_flags & PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if phdr.p_flags & PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        let aligned_vaddr = vaddr & !(crate::memory::KM_PAGE_SIZE - 1);
        let skew = vaddr - aligned_vaddr;
        let mapped_len = phdr.p_memsz + skew;
        mem.mmap(vm_fd, aligned_vaddr, mapped_len, prot | libc::PROT_WRITE)?;

        let host = mem
            .gva_to_kma(vaddr)
            .ok_or_else(|| Error::Memory(crate::memory::Error::InvalidGuestAddress(vaddr)))?;
        let file_off = phdr.p_offset as usize;
        let file_len = phdr.p_filesz as usize;
        if file_off + file_len <= bytes.len() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[file_off..file_off + file_len].as_ptr(),
                    host as *mut u8,
                    file_len,
                );
                if phdr.p_memsz > phdr.p_filesz {
                    std::ptr::write_bytes(
                        (host as *mut u8).add(file_len),
                        0,
                        (phdr.p_memsz - phdr.p_filesz) as usize,
                    );
                }
            }
        }
    }

    let descriptor = PayloadDescriptor {
        ehdr,
        phdrs,
        load_adjust,
        filename: path.display().to_string(),
    };
    Ok((descriptor, ehdr.e_entry + load_adjust))
}

fn interp_path(bytes: &[u8], phdr: &Phdr) -> Option<String> {
    let start = phdr.p_offset as usize;
    let len = phdr.p_filesz as usize;
    let raw = bytes.get(start..start + len)?;
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..nul].to_vec()).ok()
}

/// Loads `payload_path` and, if it carries a `PT_INTERP` entry, the named
/// dynamic loader as well. Returns the entry point the first vCPU's `rip`
/// should start at and both payload descriptors for later snapshotting.
pub fn load_payload(mem: &Memory, vm_fd: &VmFd, payload_path: &Path) -> Result<LoadResult> {
    let bytes = fs::read(payload_path)?;
    let (_, phdrs) = parse_elf(&bytes)?;
    let interp = phdrs
        .iter()
        .find(|p| p.p_type == PT_INTERP)
        .and_then(|p| interp_path(&bytes, p));

    let (main, entry_if_exec) = load_one(mem, vm_fd, payload_path)?;

    let (interp_descriptor, entry) = match interp {
        Some(path) => {
            let (desc, interp_entry) = load_one(mem, vm_fd, Path::new(&path))?;
            (Some(desc), interp_entry)
        }
        None => (None, entry_if_exec),
    };

    Ok(LoadResult {
        entry,
        main,
        interp: interp_descriptor,
    })
}

/// Allocates and returns the top of a fresh guest stack, used as the
/// initial `rsp` the way the teacher's `configure_regs` used
/// `BOOT_STACK_POINTER`.
pub fn allocate_stack(mem: &Memory, vm_fd: &VmFd, size: u64) -> Result<u64> {
    let base = mem.mmap(vm_fd, 0, size, libc::PROT_READ | libc::PROT_WRITE)?;
    Ok(base + size)
}
