//! Shared data structures between the eBPF kernel programs and userspace.
//!
//! These types must be `#[repr(C)]` to ensure consistent memory layout
//! across kernel and userspace. Both sides must agree on the exact byte
//! layout of map keys, map values, and perf records.

#![no_std]

pub mod inference;

// ---------------------------------------------------------------------------
// Sizing constants
// ---------------------------------------------------------------------------

/// Captured payload prefix per event. Anything beyond this is truncated;
/// `syscall_len` still reports the full syscall byte count.
pub const CAP_DATA_SIZE: usize = 1024;

/// Events accumulated in the per-CPU staging buffer before a perf flush.
pub const EVENT_BURST_NUM: u32 = 16;

/// Payload area of the staging buffer. 32760 + len(4) + events_num(4) =
/// 32768 = 2^15; the power-of-two total lets the kernel side mask lengths
/// instead of branching, which the verifier accepts on old kernels.
pub const SOCKET_BUFFER_DATA_SIZE: usize = 32760;

/// Total staging buffer size (must stay a power of two).
pub const SOCKET_BUFFER_SIZE: usize = 32768;

/// Fixed header portion of [`SocketData`] preceding the payload.
pub const SOCKET_DATA_HEADER_SIZE: usize =
    core::mem::size_of::<SocketData>() - CAP_DATA_SIZE;

/// Max iovec segments walked when copying vectored I/O payloads.
pub const IOV_SEGMENT_LIMIT: usize = 12;

/// Capacity of the per-thread active-args maps (enter → exit hand-off).
pub const ACTIVE_ARGS_MAX_ENTRIES: u32 = 10240;

/// Slots in the relay process-name config map.
pub const RELAY_COMM_MAX_ENTRIES: u32 = 4;

// ---------------------------------------------------------------------------
// Event-type registry
// ---------------------------------------------------------------------------

/// Perf records whose leading u32 is below this value are socket data
/// bursts (the u32 is then `events_num`, at most [`EVENT_BURST_NUM`]).
/// At or above it, the record is a registered extra event.
pub const EVENT_TYPE_MIN: u32 = 1 << 5;
pub const EVENT_TYPE_PROC_EXEC: u32 = 1 << 5;
pub const EVENT_TYPE_PROC_EXIT: u32 = 1 << 6;

// ---------------------------------------------------------------------------
// Enum-like constants
// ---------------------------------------------------------------------------

/// Traffic direction relative to the traced process.
pub const T_EGRESS: u8 = 0;
pub const T_INGRESS: u8 = 1;

/// L4 protocol numbers carried in `Tuple::l4_protocol`.
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Message classification produced by L7 inference.
pub const MSG_UNKNOWN: u8 = 0;
pub const MSG_REQUEST: u8 = 1;
pub const MSG_RESPONSE: u8 = 2;
/// Payload too short to classify; bytes stashed, no event emitted.
pub const MSG_PRESTORE: u8 = 3;
/// Classification needs a later payload to confirm; no event emitted.
pub const MSG_RECONFIRM: u8 = 4;
/// Recognizer invalidated the session; its state entry is deleted.
pub const MSG_CLEAR: u8 = 5;

/// Socket endpoint role.
pub const ROLE_UNKNOWN: u8 = 0;
pub const ROLE_CLIENT: u8 = 1;
pub const ROLE_SERVER: u8 = 2;

/// Inferred L7 protocol tags carried in `SocketData::data_type`.
pub const PROTO_UNKNOWN: u16 = 0;
pub const PROTO_HTTP1: u16 = 20;
pub const PROTO_HTTP2: u16 = 21;
pub const PROTO_DUBBO: u16 = 40;
pub const PROTO_MYSQL: u16 = 60;
pub const PROTO_REDIS: u16 = 80;
pub const PROTO_KAFKA: u16 = 100;
pub const PROTO_MQTT: u16 = 120;
pub const PROTO_DNS: u16 = 140;

/// Syscall that produced a record (stored in the active-args stash).
pub const SYSCALL_FUNC_UNKNOWN: u32 = 0;
pub const SYSCALL_FUNC_WRITE: u32 = 1;
pub const SYSCALL_FUNC_READ: u32 = 2;
pub const SYSCALL_FUNC_SENDTO: u32 = 3;
pub const SYSCALL_FUNC_RECVFROM: u32 = 4;
pub const SYSCALL_FUNC_SENDMSG: u32 = 5;
pub const SYSCALL_FUNC_RECVMSG: u32 = 6;
pub const SYSCALL_FUNC_SENDMMSG: u32 = 7;
pub const SYSCALL_FUNC_RECVMMSG: u32 = 8;
pub const SYSCALL_FUNC_WRITEV: u32 = 9;
pub const SYSCALL_FUNC_READV: u32 = 10;

// ---------------------------------------------------------------------------
// Map names (userspace lookup keys; must match the kernel-side statics)
// ---------------------------------------------------------------------------

pub const MAP_SOCKET_DATA: &str = "SOCKET_DATA";
pub const MAP_DATA_BUF: &str = "DATA_BUF";
pub const MAP_MEMBER_OFFSETS: &str = "MEMBER_OFFSETS";
pub const MAP_TRACE_UID: &str = "TRACE_UID";
pub const MAP_TRACE_STATS: &str = "TRACE_STATS";
pub const MAP_SOCKET_INFO: &str = "SOCKET_INFO_MAP";
pub const MAP_TRACE_INFO: &str = "TRACE_MAP";
pub const MAP_ACTIVE_WRITE_ARGS: &str = "ACTIVE_WRITE_ARGS";
pub const MAP_ACTIVE_READ_ARGS: &str = "ACTIVE_READ_ARGS";
pub const MAP_RELAY_COMMS: &str = "RELAY_COMMS";

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// Session key identifying a (process, file descriptor) pair.
#[inline]
pub const fn conn_key(tgid: u32, fd: u32) -> u64 {
    ((tgid as u64) << 32) | fd as u64
}

// ---------------------------------------------------------------------------
// Wire records (kernel → userspace)
// ---------------------------------------------------------------------------

/// Connection 5-tuple as captured from `sock_common`.
///
/// Addresses are network byte order; `addr_len` is 4 or 16. `num` is the
/// local port (host order, kernel keeps `skc_num` that way), `dport` the
/// remote port converted to host order by the probe.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Tuple {
    pub daddr: [u8; 16],
    pub saddr: [u8; 16],
    pub addr_len: u8,
    pub l4_protocol: u8,
    pub dport: u16,
    pub num: u16,
}

/// Fixed header of one captured event. The kernel side builds this on its
/// stack and writes it unaligned into the staging buffer, followed by up
/// to [`CAP_DATA_SIZE`] payload bytes; each record occupies
/// `SOCKET_DATA_HEADER_SIZE + data_len` bytes.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SocketDataHeader {
    /// Thread id (`pid == tgid` means the main thread).
    pub pid: u32,
    pub tgid: u32,
    /// Stamped by the Go uprobe collaborator; 0 for plain processes.
    pub coroutine_id: u64,
    pub comm: [u8; 16],
    /// Durable session id, unique within a boot.
    pub socket_id: u64,
    pub tuple: Tuple,
    /// Up to 4 bytes captured by a previous prestore read (MySQL, Kafka).
    pub extra_data: u32,
    pub extra_data_count: u32,
    pub tcp_seq: u32,
    pub thread_trace_id: u64,
    /// Nanoseconds since boot at capture time.
    pub timestamp: u64,
    pub direction: u8,
    pub msg_type: u8,
    /// Full byte count of the syscall, independent of capture truncation.
    pub syscall_len: u64,
    /// Per-session sequence used by userspace to order fragments.
    pub data_seq: u64,
    pub data_type: u16,
    pub data_len: u16,
}

/// One captured event as laid out in the staging buffer.
#[repr(C, packed)]
pub struct SocketData {
    pub header: SocketDataHeader,
    pub data: [u8; CAP_DATA_SIZE],
}

/// Per-CPU staging buffer flushed to the perf channel as one output.
#[repr(C)]
pub struct SocketDataBuffer {
    pub events_num: u32,
    pub len: u32,
    pub data: [u8; SOCKET_BUFFER_DATA_SIZE],
}

/// Process exec/exit record, delivered through the same perf channel.
/// Discriminated from socket bursts by `event_type >= EVENT_TYPE_MIN`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcessEvent {
    pub event_type: u32,
    pub pid: u32,
    pub name: [u8; 16],
}

// ---------------------------------------------------------------------------
// Kernel state map values
// ---------------------------------------------------------------------------

/// Per-session state, keyed by [`conn_key`].
///
/// An entry with `uid == 0` is speculative (prestore bytes or a relay
/// prestore carrying only `peer_fd`/`trace_id`) and is not yet a live
/// session; `is_valid` distinguishes the two.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketInfo {
    /// Session identity, monotonically assigned, never reused within a boot.
    pub uid: u64,
    /// Read/write sequence within the session (56-bit space).
    pub seq: u64,
    /// Trace id parked here for hand-off between paired fds on one thread.
    pub trace_id: u64,
    /// Peer fd when a distinct fd on the same process carries the paired
    /// direction (L4 relay).
    pub peer_fd: u32,
    /// Seconds since boot of last activity; drives reclamation.
    pub update_time: u32,
    /// Kafka request/response matching state; -1 when unset.
    pub correlation_id: i32,
    pub prev_data_len: u32,
    /// Stashed length-prefix bytes from a prestore read.
    pub prev_data: [u8; 4],
    pub l7_proto: u8,
    pub direction: u8,
    pub msg_type: u8,
    pub role: u8,
    pub need_reconfirm: u8,
    pub _pad: [u8; 7],
}

impl SocketInfo {
    /// Speculative entries (uid 0) carry stashed state but are not live
    /// sessions yet.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.uid != 0
    }
}

/// Per-thread in-flight trace, keyed by `pid_tgid`.
/// Ingress creates, the paired egress consumes and deletes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceInfo {
    pub thread_trace_id: u64,
    /// Session that opened the trace; same-socket egress must not link.
    pub socket_id: u64,
    pub peer_fd: u32,
    /// Seconds since boot; drives reclamation.
    pub update_time: u32,
}

/// Per-CPU id allocator state. Userspace seeds each CPU's slot with
/// `(cpu << 56) | (boot_time_ns / 100)`; the probes increment from there.
/// 56 bits of headroom lasts ~176 years at 10^7 allocations/s.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceUid {
    pub socket_id: u64,
    pub thread_trace_id: u64,
}

/// Per-CPU occupancy and drop counters for the two shared hash maps.
/// Counts are signed: userspace reclamation can make a CPU's delta
/// negative even though the cross-CPU total stays non-negative.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceStats {
    pub socket_map_count: i64,
    pub trace_map_count: i64,
    /// Inserts rejected by map capacity; the event is silently skipped.
    pub socket_map_drops: i64,
    pub trace_map_drops: i64,
}

/// Runtime-inferred byte offsets of kernel struct members. All zero until
/// the offset inferrer proves them against a live loopback exchange, then
/// `ready` flips to 1 and the probes start reading through them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemberOffsets {
    pub ready: u32,
    /// `task_struct.files`
    pub task_files: u32,
    /// `sock.__sk_flags` (bitfield word holding sk_type / sk_kern_sock)
    pub sock_flags: u32,
    /// `tcp_sock.copied_seq`
    pub tcp_copied_seq: u32,
    /// `tcp_sock.write_seq`
    pub tcp_write_seq: u32,
}

impl MemberOffsets {
    #[inline]
    pub fn complete(&self) -> bool {
        self.task_files != 0
            && self.sock_flags != 0
            && self.tcp_copied_seq != 0
            && self.tcp_write_seq != 0
    }
}

/// Syscall arguments stashed at sys_enter, consumed at sys_exit.
/// Pointers are stored as u64 so the struct is target-width independent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DataArgs {
    /// User buffer (plain read/write/sendto/recvfrom variants).
    pub buf: u64,
    /// iovec array (msg/mmsg/vec variants).
    pub iov: u64,
    /// For mmsg variants: kernel address of `mmsghdr.msg_len`.
    pub msg_len_ptr: u64,
    pub enter_ts: u64,
    pub iovlen: u32,
    pub fd: i32,
    pub source_fn: u32,
    pub _pad: u32,
}

// ---------------------------------------------------------------------------
// Layout assertions — catch padding drift at compile time
// ---------------------------------------------------------------------------

const _: () = assert!(core::mem::size_of::<Tuple>() == 38);
const _: () = assert!(core::mem::size_of::<SocketDataHeader>() == 128);
const _: () = assert!(core::mem::size_of::<SocketData>() == 128 + CAP_DATA_SIZE);
const _: () = assert!(SOCKET_DATA_HEADER_SIZE == 128);
const _: () = assert!(core::mem::size_of::<SocketDataBuffer>() == SOCKET_BUFFER_SIZE);
const _: () = assert!(SOCKET_BUFFER_SIZE.is_power_of_two());
const _: () = assert!(core::mem::size_of::<ProcessEvent>() == 24);
const _: () = assert!(core::mem::size_of::<SocketInfo>() == 56);
const _: () = assert!(core::mem::size_of::<TraceInfo>() == 24);
const _: () = assert!(core::mem::size_of::<TraceUid>() == 16);
const _: () = assert!(core::mem::size_of::<TraceStats>() == 32);
const _: () = assert!(core::mem::size_of::<MemberOffsets>() == 20);
const _: () = assert!(core::mem::size_of::<DataArgs>() == 48);

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for SocketInfo {}
    unsafe impl aya::Pod for TraceInfo {}
    unsafe impl aya::Pod for TraceUid {}
    unsafe impl aya::Pod for TraceStats {}
    unsafe impl aya::Pod for MemberOffsets {}
    unsafe impl aya::Pod for ProcessEvent {}
}
