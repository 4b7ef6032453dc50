//! Loopback exchange that drives kernel struct offset inference.
//!
//! The probes can only prove candidate offsets against a socket they
//! observe live. At startup a TCP server listens on loopback and one
//! client per online CPU — pinned to that CPU — performs a tiny
//! request/response exchange and closes. The close path runs the
//! candidate walk in kernel context, so every CPU gets a chance to fill
//! its per-CPU offsets slot; userspace then polls the map and broadcasts
//! the first proven set to all CPUs.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use aya::maps::{MapData, PerCpuArray, PerCpuValues};

use socktrace_ebpf_common::MemberOffsets;

use crate::error::TracerError;

/// Loopback port of the inference exchange.
pub const OFFSET_INFER_SERVER_PORT: u16 = 54583;

const HELLO: &[u8] = b"hello";
const REPLY: &[u8] = b"OK";
const CONNECT_RETRIES: u32 = 50;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Spawn the loopback server plus one pinned client per online CPU.
/// The server exits after serving every client (or on shutdown).
pub fn spawn_loopback_probe(
    cpus: &[u32],
    shutdown: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>, TracerError> {
    let listener = TcpListener::bind(("127.0.0.1", OFFSET_INFER_SERVER_PORT))
        .map_err(|e| TracerError::OffsetInfer(format!("bind loopback server: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| TracerError::OffsetInfer(format!("server nonblocking: {e}")))?;

    let mut handles = Vec::with_capacity(cpus.len() + 1);
    let expected = cpus.len();
    let server_shutdown = shutdown.clone();
    handles.push(
        std::thread::Builder::new()
            .name("sktrace-infer-srv".into())
            .spawn(move || server_loop(listener, expected, server_shutdown))
            .map_err(TracerError::Thread)?,
    );

    for &cpu in cpus {
        let client_shutdown = shutdown.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("sktrace-infer-{cpu}"))
                .spawn(move || client_exchange(cpu, client_shutdown))
                .map_err(TracerError::Thread)?,
        );
    }

    Ok(handles)
}

fn server_loop(listener: TcpListener, expected: usize, shutdown: Arc<AtomicBool>) {
    let mut served = 0usize;
    while served < expected && !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if serve_client(stream, peer).is_ok() {
                    served += 1;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::warn!("offset-infer accept: {e}");
                return;
            }
        }
    }
    log::debug!("offset-infer server done, served {served} clients");
}

fn serve_client(mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 16];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(()); // client closed after the exchange
        }
        if &buf[..n] == HELLO {
            stream.write_all(REPLY)?;
        } else {
            log::debug!("offset-infer unexpected bytes from {peer}");
        }
    }
}

fn client_exchange(cpu: u32, shutdown: Arc<AtomicBool>) {
    pin_to_cpu(cpu);

    let mut stream = None;
    for _ in 0..CONNECT_RETRIES {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match TcpStream::connect(("127.0.0.1", OFFSET_INFER_SERVER_PORT)) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    let Some(mut stream) = stream else {
        log::warn!("offset-infer client on cpu {cpu} could not connect");
        return;
    };

    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    if stream.write_all(HELLO).is_err() {
        return;
    }
    let mut buf = [0u8; 16];
    let _ = stream.read(&mut buf);
    // The explicit shutdown-then-drop drives sys_enter_close on this CPU
    // with the socket still established, which is what the in-kernel
    // candidate walk needs.
    let _ = stream.shutdown(Shutdown::Both);
    drop(stream);
    log::debug!("offset-infer client on cpu {cpu} finished");
}

fn pin_to_cpu(cpu: u32) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!(
                "pin offset-infer client to cpu {cpu}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Per-CPU offset state as the kernel currently sees it.
pub fn collect_offsets(
    map: &PerCpuArray<MapData, MemberOffsets>,
) -> Result<Vec<MemberOffsets>, TracerError> {
    let values = map
        .get(&0, 0)
        .map_err(|e| TracerError::Map {
            name: socktrace_ebpf_common::MAP_MEMBER_OFFSETS.into(),
            reason: e.to_string(),
        })?;
    Ok(values.iter().copied().collect())
}

/// First CPU that proved its whole offset set, if any.
pub fn find_ready(offsets: &[MemberOffsets]) -> Option<MemberOffsets> {
    offsets.iter().find(|o| o.ready == 1).copied()
}

/// Publish one proven offset set to every CPU's slot.
pub fn broadcast_offsets(
    map: &mut PerCpuArray<MapData, MemberOffsets>,
    proven: MemberOffsets,
    nr_cpus: usize,
) -> Result<(), TracerError> {
    let values = PerCpuValues::try_from(vec![proven; nr_cpus]).map_err(|e| TracerError::Map {
        name: socktrace_ebpf_common::MAP_MEMBER_OFFSETS.into(),
        reason: e.to_string(),
    })?;
    map.set(0, values, 0).map_err(|e| TracerError::Map {
        name: socktrace_ebpf_common::MAP_MEMBER_OFFSETS.into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_ready_picks_first_proven_cpu() {
        let idle = MemberOffsets::default();
        let proven = MemberOffsets {
            ready: 1,
            task_files: 0xa88,
            sock_flags: 0x208,
            tcp_copied_seq: 0x564,
            tcp_write_seq: 0x6b4,
        };
        assert_eq!(find_ready(&[idle, idle]), None);
        assert_eq!(find_ready(&[idle, proven, idle]), Some(proven));
    }

    #[test]
    fn loopback_exchange_completes() {
        // The userspace half of the inference handshake, exercised
        // without any kernel involvement.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = std::thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            serve_client(stream, peer).unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(HELLO).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], REPLY);
        drop(stream);

        srv.join().unwrap();
    }
}
