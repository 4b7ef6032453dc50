//! Socket tracer kernel programs.
//!
//! Syscall tracepoints stash arguments at enter and process the result at
//! exit; the msg/mmsg/vec variants stash from kprobes instead because
//! their kernel entry functions have a more stable argument layout than
//! the tracepoint form on older kernels.
//!
//! Safety invariants:
//! - All map operations check return values
//! - Every kernel read goes through the probe-read helpers; a failed read
//!   aborts the record silently
//! - Loop bounds and buffer indices are masked or compared against
//!   compile-time constants for the verifier
//!
//! No probe emits data until the offset inference has proven the kernel
//! struct offsets on this CPU (`MEMBER_OFFSETS.ready`).

#![no_std]
#![no_main]

mod conn;
mod maps;
mod sock;
mod submit;

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns};
use aya_ebpf::macros::{kprobe, tracepoint};
use aya_ebpf::programs::{ProbeContext, TracePointContext};

use socktrace_ebpf_common::{
    conn_key, DataArgs, ProcessEvent, SocketDataHeader, EVENT_TYPE_PROC_EXEC,
    EVENT_TYPE_PROC_EXIT, RELAY_COMM_MAX_ENTRIES, SYSCALL_FUNC_READ, SYSCALL_FUNC_READV,
    SYSCALL_FUNC_RECVFROM, SYSCALL_FUNC_RECVMMSG, SYSCALL_FUNC_RECVMSG, SYSCALL_FUNC_SENDMMSG,
    SYSCALL_FUNC_SENDMSG, SYSCALL_FUNC_SENDTO, SYSCALL_FUNC_WRITE, SYSCALL_FUNC_WRITEV, T_EGRESS,
    T_INGRESS,
};

use maps::{
    ACTIVE_READ_ARGS, ACTIVE_WRITE_ARGS, DATA_BUF, MEMBER_OFFSETS, RELAY_COMMS, SOCKET_DATA,
    SOCKET_INFO_MAP, TRACE_MAP, TRACE_STATS,
};
use submit::NS_PER_SEC;

// Tracepoint argument offsets for syscalls:* events on x86_64/arm64:
// common fields take 8 bytes, the syscall nr the next 8, arguments start
// at 16. sys_exit places the return value at 16.
const TP_ARG0: usize = 16;
const TP_ARG1: usize = 24;
const TP_RET: usize = 16;

// user_msghdr: msg_iov at +16, msg_iovlen at +24; mmsghdr appends msg_len
// at +56.
const MSGHDR_IOV_OFFSET: u64 = 16;
const MSGHDR_IOVLEN_OFFSET: u64 = 24;
const MMSGHDR_MSG_LEN_OFFSET: u64 = 56;

#[inline(always)]
fn read_at_u64(ctx: &TracePointContext, off: usize) -> u64 {
    unsafe { ctx.read_at::<u64>(off).unwrap_or(0) }
}

#[inline(always)]
fn read_at_i64(ctx: &TracePointContext, off: usize) -> i64 {
    unsafe { ctx.read_at::<i64>(off).unwrap_or(0) }
}

// ---------------------------------------------------------------------------
// Plain read/write/sendto/recvfrom — tracepoint enter stores the buffer
// pointer, tracepoint exit processes the result.
// ---------------------------------------------------------------------------

#[inline(always)]
fn stash_write(ctx: &TracePointContext, source_fn: u32) {
    let id = bpf_get_current_pid_tgid();
    let args = DataArgs {
        buf: read_at_u64(ctx, TP_ARG1),
        fd: read_at_u64(ctx, TP_ARG0) as i32,
        source_fn,
        enter_ts: unsafe { bpf_ktime_get_ns() },
        ..DataArgs::default()
    };
    let _ = ACTIVE_WRITE_ARGS.insert(&id, &args, 0);
}

#[inline(always)]
fn stash_read(ctx: &TracePointContext, source_fn: u32) {
    let id = bpf_get_current_pid_tgid();
    let args = DataArgs {
        buf: read_at_u64(ctx, TP_ARG1),
        fd: read_at_u64(ctx, TP_ARG0) as i32,
        source_fn,
        ..DataArgs::default()
    };
    let _ = ACTIVE_READ_ARGS.insert(&id, &args, 0);
}

#[tracepoint]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    stash_write(&ctx, SYSCALL_FUNC_WRITE);
    0
}

#[tracepoint]
pub fn sys_exit_write(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_WRITE_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_EGRESS, &args, ret, false);
        }
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[tracepoint]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    stash_read(&ctx, SYSCALL_FUNC_READ);
    0
}

#[tracepoint]
pub fn sys_exit_read(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_READ_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_INGRESS, &args, ret, false);
        }
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

#[tracepoint]
pub fn sys_enter_sendto(ctx: TracePointContext) -> u32 {
    stash_write(&ctx, SYSCALL_FUNC_SENDTO);
    0
}

#[tracepoint]
pub fn sys_exit_sendto(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_WRITE_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_EGRESS, &args, ret, false);
        }
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[tracepoint]
pub fn sys_enter_recvfrom(ctx: TracePointContext) -> u32 {
    stash_read(&ctx, SYSCALL_FUNC_RECVFROM);
    0
}

#[tracepoint]
pub fn sys_exit_recvfrom(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_READ_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_INGRESS, &args, ret, false);
        }
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// msg/mmsg/vec variants — kprobe enter (stable argument layout), tracepoint
// exit.
// ---------------------------------------------------------------------------

#[inline(always)]
unsafe fn read_user_u64(addr: u64) -> u64 {
    aya_ebpf::helpers::bpf_probe_read_user(addr as *const u64).unwrap_or(0)
}

#[kprobe]
pub fn __sys_sendmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let msghdr: u64 = ctx.arg(1).unwrap_or(0);
    if msghdr == 0 {
        return 0;
    }
    unsafe {
        let args = DataArgs {
            iov: read_user_u64(msghdr + MSGHDR_IOV_OFFSET),
            iovlen: read_user_u64(msghdr + MSGHDR_IOVLEN_OFFSET) as u32,
            fd: fd as i32,
            source_fn: SYSCALL_FUNC_SENDMSG,
            enter_ts: bpf_ktime_get_ns(),
            ..DataArgs::default()
        };
        let _ = ACTIVE_WRITE_ARGS.insert(&id, &args, 0);
    }
    0
}

#[tracepoint]
pub fn sys_exit_sendmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_WRITE_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_EGRESS, &args, ret, true);
        }
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn __sys_sendmmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let msgvec: u64 = ctx.arg(1).unwrap_or(0);
    let vlen: u64 = ctx.arg(2).unwrap_or(0);
    if msgvec == 0 || vlen < 1 {
        return 0;
    }
    unsafe {
        let args = DataArgs {
            iov: read_user_u64(msgvec + MSGHDR_IOV_OFFSET),
            iovlen: read_user_u64(msgvec + MSGHDR_IOVLEN_OFFSET) as u32,
            msg_len_ptr: msgvec + MMSGHDR_MSG_LEN_OFFSET,
            fd: fd as i32,
            source_fn: SYSCALL_FUNC_SENDMMSG,
            enter_ts: bpf_ktime_get_ns(),
            ..DataArgs::default()
        };
        let _ = ACTIVE_WRITE_ARGS.insert(&id, &args, 0);
    }
    0
}

#[tracepoint]
pub fn sys_exit_sendmmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let num_msgs = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_WRITE_ARGS.get(&id) {
            let args = *args;
            if num_msgs > 0 && args.msg_len_ptr != 0 {
                let bytes =
                    aya_ebpf::helpers::bpf_probe_read_user(args.msg_len_ptr as *const u32)
                        .unwrap_or(0);
                submit::process_data(&ctx, id, T_EGRESS, &args, bytes as i64, true);
            }
        }
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn __sys_recvmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let msghdr: u64 = ctx.arg(1).unwrap_or(0);
    if msghdr == 0 {
        return 0;
    }
    unsafe {
        let args = DataArgs {
            iov: read_user_u64(msghdr + MSGHDR_IOV_OFFSET),
            iovlen: read_user_u64(msghdr + MSGHDR_IOVLEN_OFFSET) as u32,
            fd: fd as i32,
            source_fn: SYSCALL_FUNC_RECVMSG,
            ..DataArgs::default()
        };
        let _ = ACTIVE_READ_ARGS.insert(&id, &args, 0);
    }
    0
}

#[tracepoint]
pub fn sys_exit_recvmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_READ_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_INGRESS, &args, ret, true);
        }
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn __sys_recvmmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let msgvec: u64 = ctx.arg(1).unwrap_or(0);
    let vlen: u64 = ctx.arg(2).unwrap_or(0);
    if msgvec == 0 || vlen < 1 {
        return 0;
    }
    unsafe {
        let args = DataArgs {
            iov: read_user_u64(msgvec + MSGHDR_IOV_OFFSET),
            iovlen: read_user_u64(msgvec + MSGHDR_IOVLEN_OFFSET) as u32,
            msg_len_ptr: msgvec + MMSGHDR_MSG_LEN_OFFSET,
            fd: fd as i32,
            source_fn: SYSCALL_FUNC_RECVMMSG,
            ..DataArgs::default()
        };
        let _ = ACTIVE_READ_ARGS.insert(&id, &args, 0);
    }
    0
}

#[tracepoint]
pub fn sys_exit_recvmmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let num_msgs = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_READ_ARGS.get(&id) {
            let args = *args;
            if num_msgs > 0 && args.msg_len_ptr != 0 {
                let bytes =
                    aya_ebpf::helpers::bpf_probe_read_user(args.msg_len_ptr as *const u32)
                        .unwrap_or(0);
                submit::process_data(&ctx, id, T_INGRESS, &args, bytes as i64, true);
            }
        }
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn do_writev(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let iov: u64 = ctx.arg(1).unwrap_or(0);
    let iovlen: u64 = ctx.arg(2).unwrap_or(0);
    let args = DataArgs {
        iov,
        iovlen: iovlen as u32,
        fd: fd as i32,
        source_fn: SYSCALL_FUNC_WRITEV,
        enter_ts: unsafe { bpf_ktime_get_ns() },
        ..DataArgs::default()
    };
    let _ = ACTIVE_WRITE_ARGS.insert(&id, &args, 0);
    0
}

#[tracepoint]
pub fn sys_exit_writev(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_WRITE_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_EGRESS, &args, ret, true);
        }
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn do_readv(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let fd: u64 = ctx.arg(0).unwrap_or(0);
    let iov: u64 = ctx.arg(1).unwrap_or(0);
    let iovlen: u64 = ctx.arg(2).unwrap_or(0);
    let args = DataArgs {
        iov,
        iovlen: iovlen as u32,
        fd: fd as i32,
        source_fn: SYSCALL_FUNC_READV,
        ..DataArgs::default()
    };
    let _ = ACTIVE_READ_ARGS.insert(&id, &args, 0);
    0
}

#[tracepoint]
pub fn sys_exit_readv(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let ret = read_at_i64(&ctx, TP_RET);
    unsafe {
        if let Some(args) = ACTIVE_READ_ARGS.get(&id) {
            let args = *args;
            submit::process_data(&ctx, id, T_INGRESS, &args, ret, true);
        }
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// close — offset inference driver and eager session eviction
// ---------------------------------------------------------------------------

/// Runs the candidate-offset walk while the loopback inference exchange is
/// closing its sockets, and eagerly deletes the session entry of any
/// closing fd once offsets are ready. close (rather than tcp_fin) also
/// covers UDP sessions.
#[tracepoint]
pub fn sys_enter_close(ctx: TracePointContext) -> u32 {
    let fd = read_at_u64(&ctx, TP_ARG0) as i32;
    if fd < 0 {
        return 0;
    }

    let Some(offsets_ptr) = MEMBER_OFFSETS.get_ptr_mut(0) else {
        return 0;
    };
    unsafe {
        if !sock::infer_offset_retry(fd, &mut *offsets_ptr) {
            return 0;
        }

        let sk = sock::get_socket_from_fd(fd, &*offsets_ptr);
        if sk != 0 {
            let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
            let key = conn_key(tgid, fd as u32);
            if let Some(si) = SOCKET_INFO_MAP.get_ptr_mut(&key) {
                submit::delete_socket_info(key, si);
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// getppid — periodic tick flushing stale staging buffers
// ---------------------------------------------------------------------------

/// Userspace calls getppid() periodically; if the oldest staged event is
/// over a second old, the buffer is flushed even though the burst is not
/// full.
#[tracepoint]
pub fn sys_enter_getppid(ctx: TracePointContext) -> u32 {
    unsafe {
        let Some(buf_ptr) = DATA_BUF.get_ptr_mut(0) else {
            return 0;
        };
        let v_buff = &mut *buf_ptr;
        if v_buff.events_num == 0 {
            return 0;
        }
        let first = v_buff.data.as_ptr() as *const SocketDataHeader;
        let oldest = core::ptr::read_unaligned(core::ptr::addr_of!((*first).timestamp));
        if bpf_ktime_get_ns().wrapping_sub(oldest) > NS_PER_SEC {
            submit::flush_buffer(&ctx, v_buff);
        }
    }
    0
}

// ---------------------------------------------------------------------------
// socket() — relay (nginx-style) peer-fd prestore
// ---------------------------------------------------------------------------

#[inline(always)]
fn comm_is_relay(comm: &[u8; 16]) -> bool {
    for i in 0..RELAY_COMM_MAX_ENTRIES {
        let Some(entry) = RELAY_COMMS.get(i) else {
            continue;
        };
        if entry[0] == 0 {
            continue;
        }
        let mut matched = true;
        for j in 0..16usize {
            if entry[j] != comm[j] {
                matched = false;
                break;
            }
            if entry[j] == 0 {
                break;
            }
        }
        if matched {
            return true;
        }
    }
    false
}

/// A relay-configured process opening a new socket while an ingress trace
/// is live gets a speculative session entry that parks the trace id and
/// the ingress fd, so the first egress write on the new fd can pick both
/// up (the L4 relay case).
#[tracepoint]
pub fn sys_exit_socket(ctx: TracePointContext) -> u32 {
    let fd = read_at_i64(&ctx, TP_RET);
    if fd < 0 {
        return 0;
    }

    let comm = bpf_get_current_comm().unwrap_or([0; 16]);
    if !comm_is_relay(&comm) {
        return 0;
    }

    let id = bpf_get_current_pid_tgid();
    unsafe {
        let Some(trace) = TRACE_MAP.get(&id) else {
            return 0;
        };
        if trace.peer_fd == 0 || trace.peer_fd == fd as u32 {
            return 0;
        }

        let sk_info = socktrace_ebpf_common::SocketInfo {
            peer_fd: trace.peer_fd,
            trace_id: trace.thread_trace_id,
            ..socktrace_ebpf_common::SocketInfo::default()
        };
        let key = conn_key((id >> 32) as u32, fd as u32);
        if SOCKET_INFO_MAP.insert(&key, &sk_info, 0).is_ok() {
            if let Some(stats) = TRACE_STATS.get_ptr_mut(0) {
                (*stats).socket_map_count += 1;
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Process lifecycle events
// ---------------------------------------------------------------------------

#[inline(always)]
fn output_process_event<C: aya_ebpf::EbpfContext>(ctx: &C, event_type: u32) {
    let event = ProcessEvent {
        event_type,
        pid: (bpf_get_current_pid_tgid() >> 32) as u32,
        name: bpf_get_current_comm().unwrap_or([0; 16]),
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &event as *const ProcessEvent as *const u8,
            core::mem::size_of::<ProcessEvent>(),
        )
    };
    SOCKET_DATA.output(ctx, bytes, 0);
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    output_process_event(&ctx, EVENT_TYPE_PROC_EXEC);
    0
}

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    output_process_event(&ctx, EVENT_TYPE_PROC_EXIT);
    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
