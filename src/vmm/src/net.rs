// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Minimal `AF_PACKET` raw-socket helper backing the `HC_net_call`
//! hypercall subfunctions. Reduced from the original's ring-buffer-based
//! packet capture (`km_net.c`) to the plain `recvfrom`/`sendto` subset the
//! dispatcher needs; no `PACKET_RX_RING` mmap'd ring is implemented here,
//! since the zero-copy receive path is a peripheral concern per
//! SPEC_FULL.md's scope.

use std::ffi::CString;
use std::os::unix::io::RawFd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetSubFunction {
    RecvPacket,
    SendPacket,
    SiocGifName,
}

impl NetSubFunction {
    pub fn try_from_raw(v: u64) -> Option<Self> {
        match v {
            0 => Some(NetSubFunction::RecvPacket),
            1 => Some(NetSubFunction::SendPacket),
            2 => Some(NetSubFunction::SiocGifName),
            _ => None,
        }
    }
}

/// Owns the raw socket, if network support was requested on the command
/// line (`--net <iface>`); otherwise every subfunction fails with ENODEV.
pub struct NetHelper {
    sock: Option<RawFd>,
    if_index: i32,
}

impl NetHelper {
    pub fn disabled() -> Self {
        NetHelper {
            sock: None,
            if_index: 0,
        }
    }

    /// Opens an `AF_PACKET`/`SOCK_RAW` socket bound to `iface`, mirroring
    /// `km_net_init`/`km_net_bind_interface`.
    pub fn bind(iface: &str) -> std::io::Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ALL as u16).to_be() as i32) };
        if sock < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let c_iface = CString::new(iface).expect("interface name must not contain NUL");
        let if_index = unsafe { libc::if_nametoindex(c_iface.as_ptr()) } as i32;
        if if_index == 0 {
            unsafe { libc::close(sock) };
            return Err(std::io::Error::last_os_error());
        }
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = if_index;
        let rc = unsafe {
            libc::bind(
                sock,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if rc < 0 {
            unsafe { libc::close(sock) };
            return Err(std::io::Error::last_os_error());
        }
        Ok(NetHelper {
            sock: Some(sock),
            if_index,
        })
    }

    /// Executes one `HC_net_call` subfunction against a host buffer that
    /// has already been translated from the guest pointer. Returns a
    /// negated errno on failure, following the hypercall ABI convention.
    pub fn dispatch(&self, sub: NetSubFunction, buf: *mut u8, len: usize) -> i64 {
        let sock = match self.sock {
            Some(fd) => fd,
            None => return -(libc::ENODEV as i64),
        };
        match sub {
            NetSubFunction::RecvPacket => {
                let n = unsafe {
                    libc::recv(sock, buf as *mut libc::c_void, len, 0)
                };
                if n < 0 {
                    -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
                } else {
                    n as i64
                }
            }
            NetSubFunction::SendPacket => {
                let n = unsafe {
                    libc::send(sock, buf as *const libc::c_void, len, 0)
                };
                if n < 0 {
                    -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
                } else {
                    n as i64
                }
            }
            NetSubFunction::SiocGifName => {
                if len < 4 {
                    return -(libc::EINVAL as i64);
                }
                unsafe {
                    std::ptr::write_unaligned(buf as *mut i32, self.if_index);
                }
                0
            }
        }
    }
}

impl Drop for NetHelper {
    fn drop(&mut self) {
        if let Some(fd) = self.sock {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_helper_reports_enodev() {
        let net = NetHelper::disabled();
        let mut buf = [0u8; 16];
        let ret = net.dispatch(NetSubFunction::RecvPacket, buf.as_mut_ptr(), buf.len());
        assert_eq!(ret, -(libc::ENODEV as i64));
    }

    #[test]
    fn subfunction_decoding() {
        assert_eq!(NetSubFunction::try_from_raw(0), Some(NetSubFunction::RecvPacket));
        assert_eq!(NetSubFunction::try_from_raw(1), Some(NetSubFunction::SendPacket));
        assert_eq!(NetSubFunction::try_from_raw(2), Some(NetSubFunction::SiocGifName));
        assert_eq!(NetSubFunction::try_from_raw(3), None);
    }
}
