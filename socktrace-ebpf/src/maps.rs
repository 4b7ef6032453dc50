//! BPF map definitions shared by all probe programs.
//!
//! `SOCKET_INFO_MAP` and `TRACE_MAP` capacities are placeholders; userspace
//! resizes them at load time from the tracer configuration.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{Array, HashMap, PerCpuArray, PerfEventByteArray};

use socktrace_ebpf_common::{
    DataArgs, MemberOffsets, SocketDataBuffer, SocketInfo, TraceInfo, TraceStats, TraceUid,
    ACTIVE_ARGS_MAX_ENTRIES, RELAY_COMM_MAX_ENTRIES,
};

/// Perf channel to userspace. Carries both socket data bursts and
/// registered extra events; the leading u32 discriminates.
#[map]
pub static SOCKET_DATA: PerfEventByteArray = PerfEventByteArray::new(0);

/// Per-CPU staging buffer. The eBPF stack is 512 bytes; payloads are
/// accumulated here and flushed as one perf output per burst.
#[map]
pub static DATA_BUF: PerCpuArray<SocketDataBuffer> = PerCpuArray::with_max_entries(1, 0);

/// Runtime-inferred kernel struct offsets, one copy per CPU.
#[map]
pub static MEMBER_OFFSETS: PerCpuArray<MemberOffsets> = PerCpuArray::with_max_entries(1, 0);

/// Per-CPU id allocator, seeded by userspace before attach.
#[map]
pub static TRACE_UID: PerCpuArray<TraceUid> = PerCpuArray::with_max_entries(1, 0);

/// Per-CPU occupancy counters for the two session maps.
#[map]
pub static TRACE_STATS: PerCpuArray<TraceStats> = PerCpuArray::with_max_entries(1, 0);

/// write-side syscall arguments stashed between enter and exit, keyed by
/// pid_tgid.
#[map]
pub static ACTIVE_WRITE_ARGS: HashMap<u64, DataArgs> =
    HashMap::with_max_entries(ACTIVE_ARGS_MAX_ENTRIES, 0);

/// read-side syscall arguments stashed between enter and exit.
#[map]
pub static ACTIVE_READ_ARGS: HashMap<u64, DataArgs> =
    HashMap::with_max_entries(ACTIVE_ARGS_MAX_ENTRIES, 0);

/// Session state keyed by `conn_key = (tgid << 32) | fd`.
#[map]
pub static SOCKET_INFO_MAP: HashMap<u64, SocketInfo> = HashMap::with_max_entries(65536, 0);

/// Per-thread in-flight trace keyed by pid_tgid.
#[map]
pub static TRACE_MAP: HashMap<u64, TraceInfo> = HashMap::with_max_entries(65536, 0);

/// Process names treated as L4 relays (the nginx case). Written by
/// userspace from the tracer configuration.
#[map]
pub static RELAY_COMMS: Array<[u8; 16]> = Array::with_max_entries(RELAY_COMM_MAX_ENTRIES, 0);
