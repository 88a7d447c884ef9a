// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Management/control plane (component F): a background thread listening on
//! a UNIX domain socket for snapshot requests. Grounded on the original's
//! `km_management.c` — same "accept, read one fixed-size request, dispatch,
//! reply, close" loop, same `KM_MGTDIR`-style self-generated socket path when
//! a management directory is configured instead of an explicit path.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

pub mod opcode {
    pub const SNAPSHOT: u32 = 1;
}

const LABEL_LEN: usize = 64;
const DESC_LEN: usize = 256;
const PATH_LEN: usize = 256;

/// Mirrors `mgmtrequest_t`'s snapshot variant: fixed-size so the whole
/// struct can be read with a single `recv`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SnapshotRequest {
    pub label: [u8; LABEL_LEN],
    pub description: [u8; DESC_LEN],
    pub snapshot_path: [u8; PATH_LEN],
    pub live: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ManagementRequest {
    pub opcode: u32,
    pub length: u32,
    pub snapshot: SnapshotRequest,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ManagementReply {
    pub request_status: i32,
}

fn bytes_of<T: Copy>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((v as *const T) as *const u8, std::mem::size_of::<T>()) }
}

fn bytes_of_mut<T: Copy>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut((v as *mut T) as *mut u8, std::mem::size_of::<T>()) }
}

fn cstr_field(buf: &[u8]) -> String {
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).into_owned()
}

/// What a snapshot request asks for, decoded from the wire struct.
pub struct SnapshotAsk {
    pub label: String,
    pub description: String,
    pub path: Option<PathBuf>,
    pub live: bool,
}

/// Handler the caller provides for a decoded snapshot request. Returning
/// `Ok(())` means the snapshot was written; the caller is responsible for
/// pausing/resuming vCPUs and, if `live` is false, calling
/// `Machine::request_exit` after the reply is sent — this module only owns
/// the socket protocol.
pub type SnapshotHandler = Arc<dyn Fn(&SnapshotAsk) -> std::io::Result<()> + Send + Sync>;

/// Builds the self-generated socket path used when a management directory
/// (rather than an explicit socket path) is configured, following
/// `km_mgt_init`'s `kmpipe.<progbase>.<pid>` naming.
pub fn generated_socket_path(mgt_dir: &Path, progname: &str, pid: u32) -> PathBuf {
    let base = Path::new(progname)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| progname.to_string());
    mgt_dir.join(format!("monpipe.{base}.{pid}"))
}

pub struct ManagementPlane {
    socket_path: PathBuf,
    kill: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ManagementPlane {
    /// Binds `socket_path`, starts listening, and spawns the accept-loop
    /// thread. Snapshot requests are handed to `on_snapshot`.
    pub fn start(socket_path: PathBuf, on_snapshot: SnapshotHandler) -> std::io::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        let kill = Arc::new(AtomicBool::new(false));
        let kill_thread = kill.clone();
        let path_for_thread = socket_path.clone();

        let handle = std::thread::Builder::new()
            .name("mgt".into())
            .spawn(move || accept_loop(listener, kill_thread, on_snapshot, &path_for_thread))
            .expect("failed to spawn management thread");

        info!(path = %socket_path.display(), "management socket listening");
        Ok(ManagementPlane {
            socket_path,
            kill,
            handle: Some(handle),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ManagementPlane {
    fn drop(&mut self) {
        self.kill.store(true, Ordering::SeqCst);
        // Connect once to unblock the accept() call so the thread notices
        // kill and exits promptly, mirroring km_mgt_fini's close-then-join.
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn accept_loop(listener: UnixListener, kill: Arc<AtomicBool>, on_snapshot: SnapshotHandler, path: &Path) {
    for stream in listener.incoming() {
        if kill.load(Ordering::SeqCst) {
            break;
        }
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "management accept failed");
                continue;
            }
        };
        if let Err(e) = handle_connection(&mut stream, &on_snapshot) {
            warn!(error = %e, "management request failed");
        }
    }
    let _ = path;
}

fn handle_connection(stream: &mut UnixStream, on_snapshot: &SnapshotHandler) -> std::io::Result<()> {
    let mut req = ManagementRequest {
        opcode: 0,
        length: 0,
        snapshot: SnapshotRequest {
            label: [0; LABEL_LEN],
            description: [0; DESC_LEN],
            snapshot_path: [0; PATH_LEN],
            live: 0,
        },
    };
    let n = stream.read(bytes_of_mut(&mut req))?;
    if n < 2 * std::mem::size_of::<u32>() {
        warn!(bytes = n, "management request too short");
        let reply = ManagementReply { request_status: libc::EINVAL };
        return stream.write_all(bytes_of(&reply));
    }

    let reply = match req.opcode {
        opcode::SNAPSHOT => {
            let ask = SnapshotAsk {
                label: cstr_field(&req.snapshot.label),
                description: cstr_field(&req.snapshot.description),
                path: {
                    let p = cstr_field(&req.snapshot.snapshot_path);
                    if p.is_empty() { None } else { Some(PathBuf::from(p)) }
                },
                live: req.snapshot.live != 0,
            };
            match on_snapshot(&ask) {
                Ok(()) => ManagementReply { request_status: 0 },
                Err(e) => ManagementReply {
                    request_status: e.raw_os_error().unwrap_or(libc::EIO),
                },
            }
        }
        other => {
            warn!(opcode = other, "unknown management request");
            ManagementReply { request_status: libc::EINVAL }
        }
    };

    stream.write_all(bytes_of(&reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn generated_path_matches_expected_shape() {
        let dir = Path::new("/tmp/mon");
        let path = generated_socket_path(dir, "/usr/bin/monitor", 4242);
        assert_eq!(path, PathBuf::from("/tmp/mon/monpipe.monitor.4242"));
    }

    #[test]
    fn request_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("test.sock");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let plane = ManagementPlane::start(
            sock_path.clone(),
            Arc::new(move |ask: &SnapshotAsk| {
                calls2.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ask.label, "mylabel");
                Ok(())
            }),
        )
        .unwrap();

        let mut stream = UnixStream::connect(&sock_path).unwrap();
        let mut req = ManagementRequest {
            opcode: opcode::SNAPSHOT,
            length: std::mem::size_of::<ManagementRequest>() as u32,
            snapshot: SnapshotRequest {
                label: [0; LABEL_LEN],
                description: [0; DESC_LEN],
                snapshot_path: [0; PATH_LEN],
                live: 1,
            },
        };
        req.snapshot.label[..7].copy_from_slice(b"mylabel");
        stream.write_all(bytes_of(&req)).unwrap();

        let mut reply = ManagementReply { request_status: -1 };
        stream.read_exact(bytes_of_mut(&mut reply)).unwrap();
        assert_eq!(reply.request_status, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(plane);
    }
}
