//! Counters exported through `SocketTracer::stats()`.
//!
//! Hot-path counters are relaxed atomics; nothing here takes a lock on
//! the data path.

use std::sync::atomic::{AtomicU64, Ordering};

use socktrace_ebpf_common::MemberOffsets;

/// Tracer lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracerState {
    /// Loaded and attached for offset inference; not delivering data.
    Init,
    /// Offsets proven (or externally stopped); probes detached.
    Stop,
    /// Probes attached and events flowing.
    Running,
}

/// Per-queue dispatch counters.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueue_nr: AtomicU64,
    pub enqueue_lost: AtomicU64,
    pub dequeue_nr: AtomicU64,
    pub burst_count: AtomicU64,
    pub alloc_fail: AtomicU64,
}

impl QueueCounters {
    #[inline]
    pub fn add_enqueue(&self, n: u64) {
        self.enqueue_nr.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_enqueue_lost(&self, n: u64) {
        self.enqueue_lost.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dequeue(&self) {
        self.dequeue_nr.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_burst(&self) {
        self.burst_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_alloc_fail(&self) {
        self.alloc_fail.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot returned by `SocketTracer::stats()`.
#[derive(Clone, Debug)]
pub struct SocketTraceStats {
    /// Samples the perf ring dropped before userspace could read them.
    pub kern_lost: u64,
    pub worker_num: u32,
    pub perf_pages_cnt: u32,
    pub queue_capacity: u32,
    pub kern_socket_map_max: u32,
    pub kern_trace_map_max: u32,
    pub socket_map_max_reclaim: u32,
    /// Kernel-side occupancy, calibrated by userspace reclaim deletions.
    pub kern_socket_map_used: i64,
    pub kern_trace_map_used: i64,
    pub kern_socket_map_drops: i64,
    pub kern_trace_map_drops: i64,
    pub user_enqueue_count: u64,
    pub user_dequeue_count: u64,
    pub user_enqueue_lost: u64,
    pub queue_burst_count: u64,
    pub mem_alloc_fail_count: u64,
    pub socket_map_reclaim_count: u64,
    pub trace_map_reclaim_count: u64,
    pub probes_count: u32,
    pub is_adapt_success: bool,
    pub tracer_state: TracerState,
    /// Delta between the two most recent boot-epoch computations.
    pub boot_time_update_diff: i64,
}

/// `stats()` plus the per-CPU offset parameters, the equivalent of the
/// original sockopt "show" surface.
#[derive(Clone, Debug)]
pub struct SocketTracerShow {
    pub stats: SocketTraceStats,
    pub offsets: Vec<MemberOffsets>,
}
