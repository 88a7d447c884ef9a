// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hypercall dispatch: decodes a trapped port-IO write into a syscall
//! number plus a guest-physical argument block, translates the guest
//! pointers each handler's signature requires, and invokes the
//! corresponding host operation.
//!
//! The dispatch table and per-call translation follow the original
//! monitor's `km_hcalls.c` closely, with two deliberate deviations recorded
//! in DESIGN.md: `shutdown` is routed to the host's real `shutdown(2)`
//! rather than the original's `SYS_ioctl` miscopy, and every guest pointer
//! argument is validated through the memory manager rather than only the
//! ones the original happened to check.

use crate::memory::Memory;
use crate::net::{NetHelper, NetSubFunction};

pub const KM_HCALL_PORT_BASE: u16 = 0x8000;
/// Out-of-band hypercall number used for the packet-capture subfunction
/// multiplexor; chosen outside the Linux syscall number range so it can
/// never collide with a real syscall.
pub const HC_NET_CALL: u32 = 0x1_0000;
/// Out-of-band hypercall number for `tbrk`, the monitor-specific sibling of
/// `brk` that grows/shrinks the upper (mmap/stack) region. There is no
/// Linux syscall number for this; the guest runtime issues it directly.
pub const HC_TBRK: u32 = 0x1_0001;

/// Mirrors `km_hc_args_t`: a guest-resident seven-`u64` record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HcArgs {
    pub hc_ret: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
}

/// What the vCPU loop should do after a hypercall returns.
pub enum HcallOutcome {
    Continue,
    Halt(i32),
    InvalidHypercall,
}

const EFAULT: i64 = -(libc::EFAULT as i64);
const ENOSYS: i64 = -(libc::ENOSYS as i64);

/// Translates a guest virtual address to a host pointer, returning `EFAULT`
/// semantics (as a hypercall return value) on failure. Every handler below
/// routes every guest-pointer argument through this, closing the gap noted
/// in DESIGN.md against the original, which validated some pointers and not
/// others.
fn translate(mem: &Memory, gva: u64) -> Result<u64, i64> {
    if gva == 0 {
        return Ok(0);
    }
    mem.gva_to_kma(gva).ok_or(EFAULT)
}

unsafe fn raw_syscall(
    num: i64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
) -> i64 {
    libc::syscall(num, a1, a2, a3, a4, a5, a6)
}

/// Reads the argument block at guest address `args_gva`, runs the handler
/// registered for `syscall_nr`, writes `hc_ret` back, and reports the
/// outcome to the vCPU loop.
pub fn dispatch(mem: &Memory, net: &NetHelper, syscall_nr: u64, args_gva: u64) -> HcallOutcome {
    let args_host = match translate(mem, args_gva) {
        Ok(addr) => addr as *mut HcArgs,
        Err(_) => return HcallOutcome::InvalidHypercall,
    };
    let args = unsafe { &mut *args_host };

    let result: Result<Outcome, i64> = match syscall_nr {
        n if n == libc::SYS_exit as u64 || n == libc::SYS_exit_group as u64 => {
            return HcallOutcome::Halt(args.arg1 as i32);
        }
        n if n == libc::SYS_read as u64 || n == libc::SYS_write as u64 => rw_hcall(mem, syscall_nr as i64, args),
        n if n == libc::SYS_readv as u64 || n == libc::SYS_writev as u64 => {
            rwv_hcall(mem, syscall_nr as i64, args)
        }
        n if n == libc::SYS_accept as u64 => accept_hcall(mem, args),
        n if n == libc::SYS_bind as u64 => bind_hcall(mem, args),
        n if n == libc::SYS_listen as u64 => listen_hcall(args),
        n if n == libc::SYS_socket as u64 => socket_hcall(args),
        n if n == libc::SYS_getsockopt as u64 => getsockopt_hcall(mem, args),
        n if n == libc::SYS_setsockopt as u64 => setsockopt_hcall(mem, args),
        n if n == libc::SYS_ioctl as u64 => ioctl_hcall(mem, args),
        n if n == libc::SYS_stat as u64 => stat_hcall(mem, args),
        n if n == libc::SYS_close as u64 => close_hcall(args),
        n if n == libc::SYS_shutdown as u64 => shutdown_hcall(args),
        n if n == libc::SYS_brk as u64 => {
            // brk is serviced entirely by the memory manager; callers wire
            // this arm through `Memory::set_brk` rather than here, since
            // that needs the VmFd the memory manager doesn't own. The
            // dispatcher only validates the argument block; `vcpu.rs`'s
            // hypercall trap handler special-cases SYS_brk before calling
            // `dispatch` for exactly this reason.
            Ok(Outcome::Ret(0))
        }
        n if n == HC_NET_CALL as u64 => net_call_hcall(mem, net, args),
        _ => Err(ENOSYS),
    };

    match result {
        Ok(Outcome::Ret(v)) => {
            args.hc_ret = v as u64;
            HcallOutcome::Continue
        }
        Err(errno) => {
            args.hc_ret = errno as u64;
            HcallOutcome::Continue
        }
    }
}

enum Outcome {
    Ret(i64),
}

fn rw_hcall(mem: &Memory, nr: i64, args: &HcArgs) -> Result<Outcome, i64> {
    let buf = translate(mem, args.arg2)?;
    let ret = unsafe { raw_syscall(nr, args.arg1, buf, args.arg3, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn rwv_hcall(mem: &Memory, nr: i64, args: &HcArgs) -> Result<Outcome, i64> {
    let iovcnt = args.arg3 as usize;
    let guest_iov_host = translate(mem, args.arg2)?;
    let mut host_iov: Vec<libc::iovec> = Vec::with_capacity(iovcnt);
    for i in 0..iovcnt {
        let entry_addr = guest_iov_host + (i * std::mem::size_of::<libc::iovec>()) as u64;
        let guest_iov_base = unsafe { *(entry_addr as *const u64) };
        let guest_iov_len = unsafe { *((entry_addr + 8) as *const u64) };
        let host_base = translate(mem, guest_iov_base)?;
        host_iov.push(libc::iovec {
            iov_base: host_base as *mut libc::c_void,
            iov_len: guest_iov_len as usize,
        });
    }
    let ret = unsafe {
        raw_syscall(
            nr,
            args.arg1,
            host_iov.as_ptr() as u64,
            iovcnt as u64,
            0,
            0,
            0,
        )
    };
    Ok(Outcome::Ret(ret))
}

fn accept_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let addr = translate(mem, args.arg2)?;
    let addrlen = translate(mem, args.arg3)?;
    let ret = unsafe { raw_syscall(libc::SYS_accept, args.arg1, addr, addrlen, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn bind_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let addr = translate(mem, args.arg2)?;
    let ret = unsafe { raw_syscall(libc::SYS_bind, args.arg1, addr, args.arg3, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn listen_hcall(args: &HcArgs) -> Result<Outcome, i64> {
    let ret = unsafe { raw_syscall(libc::SYS_listen, args.arg1, args.arg2, 0, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn socket_hcall(args: &HcArgs) -> Result<Outcome, i64> {
    let ret = unsafe { raw_syscall(libc::SYS_socket, args.arg1, args.arg2, args.arg3, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn getsockopt_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let optval = translate(mem, args.arg4)?;
    let optlen = translate(mem, args.arg5)?;
    let ret = unsafe {
        raw_syscall(
            libc::SYS_getsockopt,
            args.arg1,
            args.arg2,
            args.arg3,
            optval,
            optlen,
            0,
        )
    };
    Ok(Outcome::Ret(ret))
}

fn setsockopt_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let optval = translate(mem, args.arg4)?;
    let ret = unsafe {
        raw_syscall(
            libc::SYS_setsockopt,
            args.arg1,
            args.arg2,
            args.arg3,
            optval,
            args.arg5,
            0,
        )
    };
    Ok(Outcome::Ret(ret))
}

fn ioctl_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let argp = translate(mem, args.arg3)?;
    let ret = unsafe { raw_syscall(libc::SYS_ioctl, args.arg1, args.arg2, argp, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn stat_hcall(mem: &Memory, args: &HcArgs) -> Result<Outcome, i64> {
    let path = translate(mem, args.arg1)?;
    let statbuf = translate(mem, args.arg2)?;
    let ret = unsafe { raw_syscall(libc::SYS_stat, path, statbuf, 0, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn close_hcall(args: &HcArgs) -> Result<Outcome, i64> {
    let ret = unsafe { raw_syscall(libc::SYS_close, args.arg1, 0, 0, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

/// `shutdown(sockfd, how)`. The original source routed this through
/// `SYS_ioctl` by mistake (SPEC_FULL.md §9); we call the real syscall.
fn shutdown_hcall(args: &HcArgs) -> Result<Outcome, i64> {
    let ret = unsafe { raw_syscall(libc::SYS_shutdown, args.arg1, args.arg2, 0, 0, 0, 0) };
    Ok(Outcome::Ret(ret))
}

fn net_call_hcall(mem: &Memory, net: &NetHelper, args: &HcArgs) -> Result<Outcome, i64> {
    let sub = NetSubFunction::try_from_raw(args.arg1).ok_or(ENOSYS)?;
    let buf = translate(mem, args.arg2)?;
    let len = args.arg3 as usize;
    let ret = net.dispatch(sub, buf as *mut u8, len);
    Ok(Outcome::Ret(ret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_null_is_identity() {
        let mem = Memory::new(crate::memory::GUEST_MAX_PHYSMEM_SUPPORTED);
        assert_eq!(translate(&mem, 0), Ok(0));
    }

    #[test]
    fn translate_unmapped_returns_efault() {
        let mem = Memory::new(crate::memory::GUEST_MAX_PHYSMEM_SUPPORTED);
        assert_eq!(translate(&mem, 0xdead_beef_0000), Err(EFAULT));
    }
}
