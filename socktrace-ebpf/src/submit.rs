//! Event assembly: trace-id engine, session bookkeeping, staging-buffer
//! append and perf flush.
//!
//! The flow per syscall exit is: classify the socket, infer the L7
//! message, run the trace-id state machine, update or create the session
//! entry, then append one record to the per-CPU staging buffer. The
//! buffer flushes on the 16th event or from the periodic tick probe.

use aya_ebpf::helpers::{
    bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user,
    bpf_probe_read_user_buf,
};
use aya_ebpf::EbpfContext;

use socktrace_ebpf_common::inference::{infer_protocol, InferCtx, INFER_BUF_SIZE};
use socktrace_ebpf_common::{
    conn_key, DataArgs, MemberOffsets, SocketDataBuffer, SocketDataHeader, SocketInfo, TraceInfo,
    TraceStats, TraceUid, Tuple, CAP_DATA_SIZE, EVENT_BURST_NUM, IPPROTO_TCP, MSG_CLEAR,
    MSG_PRESTORE, MSG_RECONFIRM, MSG_REQUEST, MSG_RESPONSE, MSG_UNKNOWN, PROTO_UNKNOWN,
    SOCKET_BUFFER_DATA_SIZE, SOCKET_BUFFER_SIZE, SOCKET_DATA_HEADER_SIZE, T_EGRESS, T_INGRESS,
};

use crate::conn::ConnInfo;
use crate::maps::{
    DATA_BUF, MEMBER_OFFSETS, SOCKET_DATA, SOCKET_INFO_MAP, TRACE_MAP, TRACE_STATS, TRACE_UID,
};
use crate::sock::{self, classify_sock, get_socket_from_fd, read_addrs, read_ports, SockCheck};

pub const NS_PER_SEC: u64 = 1_000_000_000;

/// events_num + len prefix preceding the staging buffer's data area.
const BUFFER_PREFIX: usize = 8;

/// Userland iovec as read from the caller's address space.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoVec {
    base: u64,
    len: u64,
}

/// Remove a session entry and account for it on this CPU.
///
/// # Safety
/// `socket_info` must be null or a live `SOCKET_INFO_MAP` value pointer.
pub unsafe fn delete_socket_info(key: u64, socket_info: *mut SocketInfo) {
    if socket_info.is_null() {
        return;
    }
    let Some(stats) = TRACE_STATS.get_ptr_mut(0) else {
        return;
    };
    if SOCKET_INFO_MAP.remove(&key).is_ok() {
        (*stats).socket_map_count -= 1;
    }
}

/// Thread-trace state machine.
///
/// Ingress opens (or extends) the thread's trace; egress consumes and
/// deletes it. An egress on the same socket that opened the trace does
/// not cross-link (`0` is returned), so request/response on a single
/// socket never pair with themselves.
///
/// The same-direction burst test compares against the session values as
/// they were when this event arrived; the stored values are updated
/// later, in `data_submit`.
unsafe fn trace_process(
    socket_info: *mut SocketInfo,
    conn: &mut ConnInfo,
    socket_id: u64,
    pid_tgid: u64,
    trace_uid: *mut TraceUid,
    trace_stats: *mut TraceStats,
    time_stamp: u64,
) -> u64 {
    let trace_ptr = TRACE_MAP.get_ptr_mut(&pid_tgid);
    let existed = trace_ptr.is_some();

    let mut pre_trace_id = 0u64;
    let si_valid = !socket_info.is_null() && (*socket_info).uid != 0;
    if si_valid
        && conn.direction == (*socket_info).direction
        && conn.msg_type == (*socket_info).msg_type
    {
        if let Some(t) = trace_ptr {
            pre_trace_id = (*t).thread_trace_id;
        }
        // Aligned events on one socket stay in one trace, and the data
        // sequence is held so userspace can concatenate the fragments.
        conn.keep_data_seq = true;
    }

    if conn.direction == T_INGRESS {
        let id = if pre_trace_id == 0 {
            (*trace_uid).thread_trace_id += 1;
            (*trace_uid).thread_trace_id
        } else {
            pre_trace_id
        };

        let mut trace_info = TraceInfo {
            thread_trace_id: id,
            socket_id,
            peer_fd: 0,
            update_time: (time_stamp / NS_PER_SEC) as u32,
        };
        if conn.msg_type == MSG_REQUEST {
            trace_info.peer_fd = conn.fd as u32;
        } else if conn.msg_type == MSG_RESPONSE && si_valid && (*socket_info).peer_fd != 0 {
            trace_info.peer_fd = (*socket_info).peer_fd;
        }

        if TRACE_MAP.insert(&pid_tgid, &trace_info, 0).is_err() {
            (*trace_stats).trace_map_drops += 1;
        } else if !existed {
            (*trace_stats).trace_map_count += 1;
        }
        id
    } else {
        let mut id = 0u64;
        if let Some(t) = trace_ptr {
            if socket_id != (*t).socket_id {
                id = (*t).thread_trace_id;
            }
            (*trace_stats).trace_map_count -= 1;
        }
        let _ = TRACE_MAP.remove(&pid_tgid);
        id
    }
}

/// Flush the staging buffer to the perf channel and reset it.
///
/// The output size is masked against the power-of-two buffer size so the
/// verifier sees a bounded value instead of an arbitrary register.
pub unsafe fn flush_buffer<C: EbpfContext>(ctx: &C, v_buff: &mut SocketDataBuffer) {
    let size = (v_buff.len as usize + BUFFER_PREFIX) & (SOCKET_BUFFER_SIZE - 1);
    if size == 0 {
        return;
    }
    let bytes = core::slice::from_raw_parts(v_buff as *const SocketDataBuffer as *const u8, size);
    SOCKET_DATA.output(ctx, bytes, 0);
    v_buff.events_num = 0;
    v_buff.len = 0;
}

/// Copy up to [`CAP_DATA_SIZE`] payload bytes from an iovec array into the
/// staging buffer at `dst_base`. Walks at most 12 segments; each copy is
/// individually bounded for the verifier.
unsafe fn iovecs_copy(
    v_buff: &mut SocketDataBuffer,
    dst_base: usize,
    args: &DataArgs,
    syscall_len: usize,
) -> usize {
    let total = if syscall_len >= CAP_DATA_SIZE {
        CAP_DATA_SIZE
    } else {
        syscall_len
    };

    let mut sent = 0usize;
    let mut i = 0u32;
    while (i as usize) < socktrace_ebpf_common::IOV_SEGMENT_LIMIT
        && i < args.iovlen
        && sent < total
    {
        let iov: IoVec = match bpf_probe_read_user((args.iov + i as u64 * 16) as *const IoVec) {
            Ok(v) => v,
            Err(_) => break,
        };

        let remaining = total - sent;
        let mut seg = iov.len as usize;
        if seg > remaining {
            seg = remaining;
        }
        let seg = seg & (CAP_DATA_SIZE - 1);

        let off = dst_base + sent;
        if off > SOCKET_BUFFER_DATA_SIZE - CAP_DATA_SIZE {
            break;
        }
        if seg > 0 {
            let dst = core::slice::from_raw_parts_mut(v_buff.data.as_mut_ptr().add(off), seg);
            if bpf_probe_read_user_buf(iov.base as *const u8, dst).is_err() {
                break;
            }
        }
        sent += seg;
        i += 1;
    }
    sent
}

/// Assemble one record and append it to the staging buffer.
///
/// # Safety
/// Called from probe context; `conn.socket_info` must be null or live.
#[allow(clippy::too_many_arguments)]
pub unsafe fn data_submit<C: EbpfContext>(
    ctx: &C,
    conn: &mut ConnInfo,
    args: &DataArgs,
    vecs: bool,
    syscall_len: u32,
    mut time_stamp: u64,
    offsets: &MemberOffsets,
) {
    if conn.sk == 0 || conn.msg_type == MSG_UNKNOWN {
        return;
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    if time_stamp == 0 {
        time_stamp = bpf_ktime_get_ns();
    }

    if conn.msg_type == MSG_CLEAR {
        delete_socket_info(conn.conn_key, conn.socket_info);
        return;
    }

    let mut tcp_seq = 0u32;
    if conn.l4_protocol == IPPROTO_TCP {
        tcp_seq = if conn.direction == T_INGRESS {
            sock::tcp_read_seq_from_fd(conn.fd, offsets)
        } else {
            sock::tcp_write_seq_from_fd(conn.fd, offsets)
        };
    }

    let Some(trace_uid) = TRACE_UID.get_ptr_mut(0) else {
        return;
    };
    let Some(trace_stats) = TRACE_STATS.get_ptr_mut(0) else {
        return;
    };

    let socket_info = conn.socket_info;
    let si_valid = !socket_info.is_null() && (*socket_info).uid != 0;

    // Resolves same-socket non-pairing before the session entry exists:
    // the id the session is about to receive stands in for its uid.
    let socket_id = if si_valid {
        (*socket_info).uid
    } else {
        (*trace_uid).socket_id + 1
    };

    let mut thread_trace_id = 0u64;
    if conn.msg_type != MSG_PRESTORE && conn.msg_type != MSG_RECONFIRM {
        thread_trace_id = trace_process(
            socket_info,
            conn,
            socket_id,
            pid_tgid,
            trace_uid,
            trace_stats,
            time_stamp,
        );
    }

    let mut uid = 0u64;
    let mut seq = 0u64;

    if !si_valid {
        let mut sk_info = SocketInfo::default();

        // A speculative relay entry (uid 0) parks the ingress trace id
        // and peer fd for the first egress on the new socket.
        if !socket_info.is_null() && conn.direction == T_EGRESS {
            sk_info.peer_fd = (*socket_info).peer_fd;
            thread_trace_id = (*socket_info).trace_id;
        }

        sk_info.uid = (*trace_uid).socket_id + 1;
        (*trace_uid).socket_id += 1;
        sk_info.l7_proto = conn.protocol as u8;
        sk_info.direction = conn.direction;
        sk_info.role = conn.role;
        sk_info.msg_type = conn.msg_type;
        sk_info.update_time = (time_stamp / NS_PER_SEC) as u32;
        sk_info.need_reconfirm = conn.need_reconfirm as u8;
        sk_info.correlation_id = conn.correlation_id;

        if conn.msg_type == MSG_PRESTORE {
            sk_info.prev_data = conn.prev_buf;
            sk_info.prev_data_len = 4;
            sk_info.uid = 0;
        }

        uid = sk_info.uid;
        let existed = !socket_info.is_null();
        if SOCKET_INFO_MAP.insert(&conn.conn_key, &sk_info, 0).is_err() {
            (*trace_stats).socket_map_drops += 1;
            return;
        }
        if !existed {
            (*trace_stats).socket_map_count += 1;
        }
    }

    // Prestore and reconfirm only establish session state; nothing is
    // emitted until a later payload settles the classification. On an
    // already-live session the state lands in the existing entry.
    if conn.msg_type == MSG_PRESTORE || conn.msg_type == MSG_RECONFIRM {
        if si_valid {
            let si = &mut *socket_info;
            if conn.msg_type == MSG_PRESTORE {
                si.prev_data = conn.prev_buf;
                si.prev_data_len = conn.prev_count;
            }
            si.need_reconfirm = conn.need_reconfirm as u8;
            si.correlation_id = conn.correlation_id;
            si.update_time = (time_stamp / NS_PER_SEC) as u32;
        }
        return;
    }

    if si_valid {
        let si = &mut *socket_info;
        uid = si.uid;

        if conn.keep_data_seq {
            seq = si.seq;
        } else {
            si.seq += 1;
            seq = si.seq;
        }

        si.direction = conn.direction;
        si.msg_type = conn.msg_type;
        si.role = conn.role;
        si.need_reconfirm = conn.need_reconfirm as u8;
        si.correlation_id = conn.correlation_id;
        si.update_time = (time_stamp / NS_PER_SEC) as u32;

        // Relay hand-off, ingress side: park the trace id on the peer
        // socket so its next egress can pick it up.
        if si.peer_fd != 0 && conn.direction == T_INGRESS {
            let peer_key = conn_key(tgid, si.peer_fd);
            if let Some(peer) = SOCKET_INFO_MAP.get_ptr_mut(&peer_key) {
                if (*peer).uid != 0 {
                    (*peer).trace_id = thread_trace_id;
                }
            }
        }

        // Relay hand-off, egress side: consume a parked trace id.
        if conn.direction == T_EGRESS && si.trace_id != 0 {
            thread_trace_id = si.trace_id;
            si.trace_id = 0;
        }
    }

    let Some(buf_ptr) = DATA_BUF.get_ptr_mut(0) else {
        return;
    };
    let v_buff = &mut *buf_ptr;

    let base = v_buff.len as usize;
    if base > SOCKET_BUFFER_DATA_SIZE - core::mem::size_of::<socktrace_ebpf_common::SocketData>() {
        return;
    }

    // Payload first: the final captured length lands in the header.
    let payload_base = base + SOCKET_DATA_HEADER_SIZE;
    let data_len = if vecs {
        iovecs_copy(v_buff, payload_base, args, syscall_len as usize)
    } else {
        let want = syscall_len as usize;
        let n = if want >= CAP_DATA_SIZE {
            CAP_DATA_SIZE
        } else {
            want & (CAP_DATA_SIZE - 1)
        };
        if n > 0 {
            let dst = core::slice::from_raw_parts_mut(v_buff.data.as_mut_ptr().add(payload_base), n);
            if bpf_probe_read_user_buf(args.buf as *const u8, dst).is_err() {
                return;
            }
        }
        n
    };

    let mut tuple = Tuple {
        daddr: [0; 16],
        saddr: [0; 16],
        addr_len: 0,
        l4_protocol: conn.l4_protocol,
        dport: conn.dport,
        num: conn.sport,
    };
    tuple.addr_len = read_addrs(conn.sk, conn.family, &mut tuple.daddr, &mut tuple.saddr);
    if tuple.addr_len == 0 {
        return;
    }

    let mut header = SocketDataHeader {
        pid: pid_tgid as u32,
        tgid,
        coroutine_id: 0,
        comm: bpf_get_current_comm().unwrap_or([0; 16]),
        socket_id: uid,
        tuple,
        extra_data: 0,
        extra_data_count: 0,
        tcp_seq: 0,
        thread_trace_id,
        timestamp: time_stamp,
        direction: conn.direction,
        msg_type: conn.msg_type,
        syscall_len: syscall_len as u64,
        data_seq: seq,
        data_type: conn.protocol,
        data_len: data_len as u16,
    };

    if conn.l4_protocol == IPPROTO_TCP {
        header.tcp_seq = tcp_seq.wrapping_sub(syscall_len);
    }

    // Bytes consumed from a prestore read travel in the header; userspace
    // prepends them and shifts tcp_seq so both peers' sequences match.
    if conn.prev_count > 0 {
        header.extra_data = u32::from_ne_bytes(conn.prev_buf);
        header.extra_data_count = conn.prev_count;
        header.tcp_seq = header.tcp_seq.wrapping_sub(conn.prev_count);
    }

    let dst = v_buff.data.as_mut_ptr().add(base) as *mut SocketDataHeader;
    core::ptr::write_unaligned(dst, header);

    v_buff.len += (SOCKET_DATA_HEADER_SIZE + data_len) as u32;
    v_buff.events_num += 1;

    if v_buff.events_num == EVENT_BURST_NUM {
        flush_buffer(ctx, v_buff);
    }
}

/// Read the first non-empty iovec, bounded to 3 probes: some callers park
/// the length in a later segment.
unsafe fn first_iovec(args: &DataArgs) -> (u64, usize) {
    let mut iov = IoVec { base: 0, len: 0 };
    let mut i = 0u32;
    while i < 3 && i < args.iovlen {
        iov = match bpf_probe_read_user((args.iov + i as u64 * 16) as *const IoVec) {
            Ok(v) => v,
            Err(_) => break,
        };
        if iov.len != 0 {
            break;
        }
        i += 1;
    }
    (iov.base, iov.len as usize)
}

/// Common exit-handler path for every traced read/write style syscall.
///
/// # Safety
/// Called from probe context only.
pub unsafe fn process_data<C: EbpfContext>(
    ctx: &C,
    id: u64,
    direction: u8,
    args: &DataArgs,
    bytes_count: i64,
    vecs: bool,
) {
    if !vecs && args.buf == 0 {
        return;
    }
    if vecs && (args.iov == 0 || args.iovlen == 0) {
        return;
    }
    // fds 0-2 are stdio; negative counts are errno returns.
    if args.fd <= 2 || bytes_count <= 0 {
        return;
    }

    let Some(offsets_ptr) = MEMBER_OFFSETS.get_ptr_mut(0) else {
        return;
    };
    let offsets = &*offsets_ptr;
    if offsets.ready == 0 {
        return;
    }

    let sk = get_socket_from_fd(args.fd, offsets);
    if sk == 0 {
        return;
    }
    let (check, facts) = classify_sock(sk, offsets);
    if check == SockCheck::Error {
        return;
    }

    let tgid = (id >> 32) as u32;
    let key = conn_key(tgid, args.fd as u32);

    let mut conn = ConnInfo::new(sk, args.fd, key, direction);
    conn.family = facts.family;
    conn.l4_protocol = facts.l4_protocol;
    let (dport, sport) = read_ports(sk);
    conn.dport = dport;
    conn.sport = sport;

    if let Some(si_ptr) = SOCKET_INFO_MAP.get_ptr_mut(&key) {
        conn.socket_info = si_ptr;
        let si = &mut *si_ptr;
        conn.existing_l7 = si.l7_proto as u16;
        conn.role = si.role;
        conn.need_reconfirm = si.need_reconfirm != 0;
        conn.correlation_id = si.correlation_id;
        if si.prev_data_len == 4 {
            conn.prev_buf = si.prev_data;
            conn.prev_count = 4;
            si.prev_data_len = 0;
        }
    }

    // Sample the payload head for classification.
    let (src, src_len) = if vecs {
        let (base, len) = first_iovec(args);
        (base, core::cmp::min(len, bytes_count as usize))
    } else {
        (args.buf, bytes_count as usize)
    };
    if src == 0 {
        return;
    }
    let mut sample = [0u8; INFER_BUF_SIZE];
    let n = core::cmp::min(src_len, INFER_BUF_SIZE);
    if n > 0 {
        let dst = &mut sample[..n];
        if bpf_probe_read_user_buf(src as *const u8, dst).is_err() {
            return;
        }
    }

    let mut ictx = InferCtx {
        direction,
        l4_protocol: conn.l4_protocol,
        dport: conn.dport,
        sport: conn.sport,
        existing_l7: conn.existing_l7,
        role: conn.role,
        need_reconfirm: conn.need_reconfirm,
        correlation_id: conn.correlation_id,
        prev: conn.prev_buf,
        prev_len: conn.prev_count,
    };
    let inferred = infer_protocol(&sample[..n], bytes_count as usize, &mut ictx);

    conn.protocol = inferred.protocol;
    conn.msg_type = inferred.msg_type;
    conn.role = ictx.role;
    conn.need_reconfirm = ictx.need_reconfirm;
    conn.correlation_id = ictx.correlation_id;
    conn.prev_buf = ictx.prev;
    conn.prev_count = ictx.prev_len;

    if conn.protocol != PROTO_UNKNOWN || conn.msg_type != MSG_UNKNOWN {
        data_submit(
            ctx,
            &mut conn,
            args,
            vecs,
            bytes_count as u32,
            args.enter_ts,
            offsets,
        );
    }
}
