//! Tracer configuration.

use std::path::PathBuf;

use crate::error::TracerError;

/// Idle threshold for time-based map eviction: entries with no read/write
/// activity for this long are reclaimed once the usage threshold trips.
pub const SOCKET_RECLAIM_TIMEOUT_SECS: u64 = 10;
pub const TRACE_RECLAIM_TIMEOUT_SECS: u64 = 10;

/// The trace map reclaims once it reaches this fraction of its capacity.
pub const RECLAIM_TRACE_MAP_SCALE: f64 = 0.5;

/// Environment variable overriding the eBPF object path.
pub const BPF_OBJECT_ENV: &str = "SOCKTRACE_BPF_OBJECT";

const DEFAULT_BPF_OBJECT: &str = "target/bpfel-unknown-none/release/socktrace-ebpf";

#[derive(Clone, Debug)]
pub struct TracerConfig {
    /// Worker threads consuming the dispatch queues.
    pub thread_nr: usize,
    /// Page frames per perf ring, a power of two.
    pub perf_pages_cnt: u32,
    /// Dispatch queue capacity, a power of two.
    pub queue_size: u32,
    /// Hash capacity for socket session tracking.
    pub max_socket_entries: u32,
    /// Hash capacity for per-thread trace sessions.
    pub max_trace_entries: u32,
    /// Socket map usage at which time-based reclamation kicks in.
    pub socket_map_max_reclaim: u32,
    /// Process names treated as L4 relays for peer-fd tracing.
    pub relay_comms: Vec<String>,
    /// Compiled kernel-side object; `SOCKTRACE_BPF_OBJECT` overrides.
    pub bpf_object: PathBuf,
}

impl Default for TracerConfig {
    fn default() -> Self {
        let bpf_object = std::env::var_os(BPF_OBJECT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BPF_OBJECT));
        TracerConfig {
            thread_nr: 4,
            perf_pages_cnt: 128,
            queue_size: 65536,
            max_socket_entries: 524288,
            max_trace_entries: 524288,
            socket_map_max_reclaim: 520000,
            relay_comms: vec!["nginx".to_string()],
            bpf_object,
        }
    }
}

impl TracerConfig {
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.thread_nr == 0 {
            return Err(TracerError::Config("thread_nr must be >= 1".into()));
        }
        if !self.perf_pages_cnt.is_power_of_two() {
            return Err(TracerError::Config(format!(
                "perf_pages_cnt {} is not a power of two",
                self.perf_pages_cnt
            )));
        }
        if !self.queue_size.is_power_of_two() {
            return Err(TracerError::Config(format!(
                "queue_size {} is not a power of two",
                self.queue_size
            )));
        }
        if self.max_socket_entries == 0 || self.max_trace_entries == 0 {
            return Err(TracerError::Config("map capacities must be nonzero".into()));
        }
        if self.socket_map_max_reclaim > self.max_socket_entries {
            return Err(TracerError::Config(format!(
                "socket_map_max_reclaim {} exceeds max_socket_entries {}",
                self.socket_map_max_reclaim, self.max_socket_entries
            )));
        }
        if self.relay_comms.len() > socktrace_ebpf_common::RELAY_COMM_MAX_ENTRIES as usize {
            return Err(TracerError::Config(format!(
                "at most {} relay process names are supported",
                socktrace_ebpf_common::RELAY_COMM_MAX_ENTRIES
            )));
        }
        for name in &self.relay_comms {
            // Kernel comm is at most 15 bytes + NUL.
            if name.is_empty() || name.len() > 15 {
                return Err(TracerError::Config(format!(
                    "relay comm {name:?} must be 1..=15 bytes"
                )));
            }
        }
        Ok(())
    }

    /// Trace map usage at which time-based reclamation kicks in.
    pub fn trace_map_reclaim_threshold(&self) -> u64 {
        (self.max_trace_entries as f64 * RECLAIM_TRACE_MAP_SCALE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(TracerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_queue() {
        let cfg = TracerConfig {
            queue_size: 1000,
            ..TracerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = TracerConfig {
            thread_nr: 0,
            ..TracerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_reclaim_above_capacity() {
        let cfg = TracerConfig {
            max_socket_entries: 1024,
            socket_map_max_reclaim: 2048,
            ..TracerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_relay_comm() {
        let cfg = TracerConfig {
            relay_comms: vec!["a-process-name-longer-than-comm".into()],
            ..TracerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trace_reclaim_threshold_is_half_capacity() {
        let cfg = TracerConfig {
            max_trace_entries: 1000,
            ..TracerConfig::default()
        };
        assert_eq!(cfg.trace_map_reclaim_threshold(), 500);
    }
}
