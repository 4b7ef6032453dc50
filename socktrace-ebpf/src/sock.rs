//! fd → `struct sock *` resolution and runtime offset inference.
//!
//! The probes cannot rely on kernel headers: field offsets inside
//! `task_struct`, `sock` and `tcp_sock` vary by kernel version and config.
//! Candidate offsets are walked at runtime against a live loopback TCP
//! exchange driven by userspace, and each candidate must pass a semantic
//! check before it is accepted. Until every offset is proven, `ready`
//! stays 0 and no probe emits data.

use aya_ebpf::helpers::{bpf_probe_read_kernel, r#gen};

use socktrace_ebpf_common::{MemberOffsets, IPPROTO_TCP, IPPROTO_UDP};

// Offsets that are stable across the supported kernel range (>= 4.14).
const FILES_STRUCT_FDT_OFFSET: u64 = 0x20;
const FILE_PRIVATE_DATA_OFFSET: u64 = 0xc8;
const SOCK_FAMILY_OFFSET: u64 = 0x10;
const SOCK_SKC_STATE_OFFSET: u64 = 0x12;
const SOCK_COMMON_FLAGS_OFFSET: u64 = 0x13;
const SOCK_DADDR_OFFSET: u64 = 0x0;
const SOCK_SADDR_OFFSET: u64 = 0x4;
const SOCK_DPORT_OFFSET: u64 = 0xc;
const SOCK_SPORT_OFFSET: u64 = 0xe;
const SOCK_V6_DADDR_OFFSET: u64 = 0x38;
const SOCK_V6_SADDR_OFFSET: u64 = 0x48;

pub const PF_INET: u16 = 2;
pub const PF_INET6: u16 = 10;
pub const SOCK_STREAM: u16 = 1;
pub const SOCK_DGRAM: u16 = 2;

const TCP_ESTABLISHED: u8 = 1;
const TCP_CLOSE_WAIT: u8 = 8;

/// Candidate offsets of `task_struct.files`.
const TASK_FILES_OFFSETS: [u64; 51] = [
    0x790, 0xa80, 0xa88, 0xa90, 0xa98, 0xaa0, 0xaa8, 0xab0, 0xab8, 0xac0, //
    0xac8, 0xad0, 0xad8, 0xae0, 0xae8, 0xaf0, 0xaf8, 0xb00, 0xb08, 0xb10, //
    0xb18, 0xb20, 0xb28, 0xb48, 0xb50, 0xb58, 0xb60, 0xb68, 0xb70, 0xb78, //
    0xb80, 0xb88, 0xb90, 0xb98, 0xba0, 0xba8, 0xbb0, 0xbb8, 0xbc0, 0xbc8, //
    0xbd0, 0xbd8, 0xbe0, 0xbe8, 0xbf0, 0xbf8, 0xc00, 0xc08, 0xc10, 0xc18, //
    0xcc8,
];

/// Candidate offsets of the `__sk_flags` word in `struct sock`.
const SOCK_FLAGS_OFFSETS: [u64; 6] = [0x1f0, 0x1f8, 0x200, 0x208, 0x210, 0x218];

/// Candidate offsets of `tcp_sock.copied_seq`.
const COPIED_SEQ_OFFSETS: [u64; 19] = [
    0x514, 0x51c, 0x524, 0x52c, 0x534, 0x53c, 0x544, 0x54c, 0x554, 0x55c, //
    0x564, 0x56c, 0x574, 0x57c, 0x584, 0x58c, 0x594, 0x59c, 0x5dc,
];

/// Candidate offsets of `tcp_sock.write_seq`.
const WRITE_SEQ_OFFSETS: [u64; 24] = [
    0x66c, 0x674, 0x67c, 0x684, 0x68c, 0x694, 0x69c, 0x6a4, 0x6ac, 0x6b4, //
    0x6bc, 0x6c4, 0x6cc, 0x6d4, 0x6dc, 0x6e4, 0x6ec, 0x6f4, 0x6fc, 0x704, //
    0x70c, 0x714, 0x71c, 0x74c,
];

/// Mirror of the tail of `struct socket`. The head (`state`, `type`,
/// `flags`) is at fixed offsets; `wq` was removed in 5.3 which shifts the
/// pointer triple, handled in `resolve_sock_ptr`.
#[repr(C)]
#[derive(Clone, Copy)]
struct KernSocket {
    state: u32,
    sk_type: u16,
    _pad: u16,
    flags: u64,
    wq: u64,
    file: u64,
    sk: u64,
    ops: u64,
}

#[inline(always)]
unsafe fn read<T>(addr: u64) -> Result<T, i64> {
    bpf_probe_read_kernel(addr as *const T)
}

#[inline(always)]
fn current_task() -> u64 {
    unsafe { r#gen::bpf_get_current_task() }
}

/// Walk `task->files->fdt->fd[fd_num]` with a candidate `files` offset.
#[inline(always)]
unsafe fn file_addr_via(task: u64, fd_num: i32, files_off: u64) -> Option<u64> {
    let files: u64 = read(task + files_off).ok()?;
    if files == 0 {
        return None;
    }
    let fdt: u64 = read(files + FILES_STRUCT_FDT_OFFSET).ok()?;
    // fdtable: { max_fds: u32, struct file **fd }
    let fd_array: u64 = read(fdt + 8).ok()?;
    let file: u64 = read(fd_array + 8 * fd_num as u64).ok()?;
    if file == 0 {
        return None;
    }
    Some(file)
}

/// From a `struct file *`, reach the `struct sock *` through
/// `file->private_data` (a `struct socket`), validating the back-pointer.
#[inline(always)]
unsafe fn resolve_sock_ptr(file: u64) -> Option<u64> {
    let private_data: u64 = read(file + FILE_PRIVATE_DATA_OFFSET).ok()?;
    if private_data == 0 {
        return None;
    }
    let sock: KernSocket = read(private_data).ok()?;
    // Kernels >= 5.3 dropped socket.wq; the pointer triple shifts up one
    // slot, so the back-pointer check decides which layout is live.
    let (check_file, sk) = if sock.file != file {
        (sock.wq, sock.file)
    } else {
        (sock.file, sock.sk)
    };
    if (sock.sk_type == SOCK_STREAM || sock.sk_type == SOCK_DGRAM) && check_file == file {
        return Some(sk);
    }
    None
}

/// fd → `struct sock *` using the proven offsets. Returns 0 on any miss.
#[inline(always)]
pub fn get_socket_from_fd(fd_num: i32, offsets: &MemberOffsets) -> u64 {
    if fd_num < 0 {
        return 0;
    }
    let task = current_task();
    unsafe {
        let Some(file) = file_addr_via(task, fd_num, offsets.task_files as u64) else {
            return 0;
        };
        resolve_sock_ptr(file).unwrap_or(0)
    }
}

/// fd → `struct sock *` while `task_files` is still unknown: walk the
/// candidate table and latch the first offset that yields a socket whose
/// back-pointer is self-consistent.
#[inline(always)]
unsafe fn infer_and_get_socket_from_fd(fd_num: i32, offsets: &mut MemberOffsets) -> u64 {
    if offsets.task_files != 0 {
        return get_socket_from_fd(fd_num, offsets);
    }
    let task = current_task();
    for off in TASK_FILES_OFFSETS {
        if let Some(file) = file_addr_via(task, fd_num, off) {
            if resolve_sock_ptr(file).is_some() {
                offsets.task_files = off as u32;
                return resolve_sock_ptr(file).unwrap_or(0);
            }
        }
    }
    0
}

/// `__sk_flags` bitfield layout: sk_padding:1, sk_kern_sock:1,
/// sk_no_check_tx:1, sk_no_check_rx:1, sk_userlocks:4, sk_protocol:8,
/// sk_type:16.
#[inline(always)]
fn flags_sk_type(flags: u32) -> u16 {
    (flags >> 16) as u16
}

#[inline(always)]
unsafe fn infer_sock_flags(sk: u64, offsets: &mut MemberOffsets) {
    for off in SOCK_FLAGS_OFFSETS {
        let flags: u32 = match read(sk + off) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let sk_type = flags_sk_type(flags);
        let kern_sock = (flags >> 1) & 1;
        let padding = flags & 1;
        // sk_alloc() zeroes the sock, so sk_padding must read 0 on the
        // real offset; that rejects most lookalike words.
        if (sk_type == SOCK_DGRAM || sk_type == SOCK_STREAM) && kern_sock == 0 && padding == 0 {
            offsets.sock_flags = off as u32;
            break;
        }
    }
}

/// Semantic check for `copied_seq`: on a drained receive queue
/// `copied_seq == rcv_nxt == rcv_wup`, all nonzero, and the adjacent
/// `tcp_header_len` (offset -28) must be a sane TCP header size.
#[inline(always)]
unsafe fn retry_get_copied_seq(sk: u64, off: u64) -> u32 {
    let copied_seq: u32 = match read(sk + off) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let rcv_nxt: u32 = match read(sk + off - 4) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let rcv_wup: u32 = match read(sk + off + 4) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let tcp_header_len: u16 = match read(sk + off - 28) {
        Ok(v) => v,
        Err(_) => return 0,
    };

    if !(20..=60).contains(&tcp_header_len) || copied_seq == 0 {
        return 0;
    }
    if copied_seq == rcv_nxt && rcv_wup == rcv_nxt {
        return copied_seq;
    }
    0
}

/// Semantic check for `write_seq`: with no unsent data
/// `write_seq == snd_nxt`, both nonzero. `snd_nxt` sits at
/// `copied_seq + 8`, so this only runs once `copied_seq` is proven.
#[inline(always)]
unsafe fn retry_get_write_seq(sk: u64, off: u64, snd_nxt_off: u64) -> u32 {
    let write_seq: u32 = match read(sk + off) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let snd_nxt: u32 = match read(sk + snd_nxt_off) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    if snd_nxt == write_seq && snd_nxt != 0 {
        return write_seq;
    }
    0
}

#[inline(always)]
unsafe fn infer_tcp_seq_offsets(sk: u64, offsets: &mut MemberOffsets) {
    if offsets.tcp_copied_seq == 0 {
        for off in COPIED_SEQ_OFFSETS {
            if retry_get_copied_seq(sk, off) != 0 {
                offsets.tcp_copied_seq = off as u32;
                break;
            }
        }
    }

    let snd_nxt_off = offsets.tcp_copied_seq as u64 + 8;
    if snd_nxt_off == 8 {
        return;
    }

    if offsets.tcp_write_seq == 0 {
        for off in WRITE_SEQ_OFFSETS {
            if retry_get_write_seq(sk, off, snd_nxt_off) != 0 {
                offsets.tcp_write_seq = off as u32;
                break;
            }
        }
    }
}

/// One inference attempt against the fd of a live loopback connection.
/// Returns true once every offset on this CPU is proven.
#[inline(always)]
pub fn infer_offset_retry(fd: i32, offsets: &mut MemberOffsets) -> bool {
    if offsets.ready != 0 {
        return true;
    }
    unsafe {
        let sk = infer_and_get_socket_from_fd(fd, offsets);
        if sk != 0 {
            if offsets.sock_flags == 0 {
                infer_sock_flags(sk, offsets);
            }
            if offsets.tcp_copied_seq == 0 || offsets.tcp_write_seq == 0 {
                infer_tcp_seq_offsets(sk, offsets);
            }
            if offsets.complete() {
                offsets.ready = 1;
            }
        }
    }
    offsets.ready != 0
}

/// Socket classification result.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SockCheck {
    Error,
    Udp,
    TcpEstablished,
}

/// L4 facts read from `sock_common` during classification.
pub struct SockFacts {
    pub family: u16,
    pub sk_type: u16,
    pub l4_protocol: u8,
}

/// Accept PF_INET, and PF_INET6 that is not v6-only (folded to PF_INET).
/// TCP sockets are accepted only in ESTABLISHED or CLOSE_WAIT.
#[inline(always)]
pub fn classify_sock(sk: u64, offsets: &MemberOffsets) -> (SockCheck, SockFacts) {
    let mut facts = SockFacts {
        family: 0,
        sk_type: 0,
        l4_protocol: 0,
    };
    unsafe {
        let family: u16 = match read(sk + SOCK_FAMILY_OFFSET) {
            Ok(v) => v,
            Err(_) => return (SockCheck::Error, facts),
        };
        let skc_flags: u8 = match read(sk + SOCK_COMMON_FLAGS_OFFSET) {
            Ok(v) => v,
            Err(_) => return (SockCheck::Error, facts),
        };
        // skc_reuse:4, skc_reuseport:1, skc_ipv6only:1, skc_net_refcnt:1
        let ipv6only = (skc_flags >> 5) & 1;

        facts.family = match family {
            PF_INET => PF_INET,
            PF_INET6 if ipv6only == 0 => PF_INET,
            PF_INET6 => PF_INET6,
            _ => return (SockCheck::Error, facts),
        };

        let flags: u32 = match read(sk + offsets.sock_flags as u64) {
            Ok(v) => v,
            Err(_) => return (SockCheck::Error, facts),
        };
        facts.sk_type = flags_sk_type(flags);

        if facts.sk_type == SOCK_DGRAM {
            facts.l4_protocol = IPPROTO_UDP;
            return (SockCheck::Udp, facts);
        }
        if facts.sk_type != SOCK_STREAM {
            return (SockCheck::Error, facts);
        }

        let state: u8 = match read(sk + SOCK_SKC_STATE_OFFSET) {
            Ok(v) => v,
            Err(_) => return (SockCheck::Error, facts),
        };
        if (1u32 << state) & !((1 << TCP_ESTABLISHED) | (1 << TCP_CLOSE_WAIT)) != 0 {
            return (SockCheck::Error, facts);
        }

        facts.l4_protocol = IPPROTO_TCP;
        (SockCheck::TcpEstablished, facts)
    }
}

/// Remote/local ports from `sock_common` (dport arrives big-endian).
#[inline(always)]
pub fn read_ports(sk: u64) -> (u16, u16) {
    unsafe {
        let dport: u16 = read(sk + SOCK_DPORT_OFFSET).unwrap_or(0);
        let sport: u16 = read(sk + SOCK_SPORT_OFFSET).unwrap_or(0);
        (u16::from_be(dport), sport)
    }
}

/// Copy the address pair into `daddr`/`saddr`; returns the address length
/// (4 or 16) or 0 on an unsupported family.
#[inline(always)]
pub fn read_addrs(sk: u64, family: u16, daddr: &mut [u8; 16], saddr: &mut [u8; 16]) -> u8 {
    unsafe {
        match family {
            PF_INET => {
                let d: [u8; 4] = match read(sk + SOCK_DADDR_OFFSET) {
                    Ok(v) => v,
                    Err(_) => return 0,
                };
                let s: [u8; 4] = match read(sk + SOCK_SADDR_OFFSET) {
                    Ok(v) => v,
                    Err(_) => return 0,
                };
                daddr[..4].copy_from_slice(&d);
                saddr[..4].copy_from_slice(&s);
                4
            }
            PF_INET6 => {
                let d: [u8; 16] = match read(sk + SOCK_V6_DADDR_OFFSET) {
                    Ok(v) => v,
                    Err(_) => return 0,
                };
                let s: [u8; 16] = match read(sk + SOCK_V6_SADDR_OFFSET) {
                    Ok(v) => v,
                    Err(_) => return 0,
                };
                *daddr = d;
                *saddr = s;
                16
            }
            _ => 0,
        }
    }
}

/// `tcp_sock.copied_seq` for an fd (ingress records).
#[inline(always)]
pub fn tcp_read_seq_from_fd(fd: i32, offsets: &MemberOffsets) -> u32 {
    let sk = get_socket_from_fd(fd, offsets);
    if sk == 0 {
        return 0;
    }
    unsafe { read(sk + offsets.tcp_copied_seq as u64).unwrap_or(0) }
}

/// `tcp_sock.write_seq` for an fd (egress records).
#[inline(always)]
pub fn tcp_write_seq_from_fd(fd: i32, offsets: &MemberOffsets) -> u32 {
    let sk = get_socket_from_fd(fd, offsets);
    if sk == 0 {
        return 0;
    }
    unsafe { read(sk + offsets.tcp_write_seq as u64).unwrap_or(0) }
}
