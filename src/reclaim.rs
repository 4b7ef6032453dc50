//! Periodic maintenance: map reclamation and the kernel-adaptation check.
//!
//! One thread ticks every second. Until offsets are proven it polls the
//! per-CPU offset map; afterwards it watches map occupancy and evicts
//! idle entries once the configured thresholds trip. The tick also calls
//! getppid(), which the kernel side repurposes as the staging-buffer
//! flush timer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, tick};

use socktrace_ebpf_common::TraceStats;

use crate::config::{SOCKET_RECLAIM_TIMEOUT_SECS, TRACE_RECLAIM_TIMEOUT_SECS};
use crate::error::TracerError;
use crate::stats::TracerState;
use crate::time;
use crate::tracer::{detach_probes, Inner};
use crate::{capability, offset};

const PERIOD: Duration = Duration::from_secs(1);

pub(crate) fn spawn_periodic(inner: Arc<Inner>) -> Result<JoinHandle<()>, TracerError> {
    std::thread::Builder::new()
        .name("sktrace-periodic".into())
        .spawn(move || periodic_loop(&inner))
        .map_err(TracerError::Thread)
}

fn periodic_loop(inner: &Inner) {
    let ticker = tick(PERIOD);
    loop {
        select! {
            recv(ticker) -> _ => {}
        }
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }

        // The kernel hijacks this syscall's tracepoint as its staging
        // flush tick; events older than a second go out now even if the
        // burst never filled.
        unsafe {
            libc::getppid();
        }

        refresh_boot_time(inner);

        if !inner.adapt_success.load(Ordering::Relaxed) {
            check_kern_adapt(inner);
        }
        check_map_exceeded(inner);
    }
}

fn refresh_boot_time(inner: &Inner) {
    let current = time::boot_time_ns();
    let prev = inner.boot_time_ns.swap(current, Ordering::Relaxed);
    inner.prev_boot_time_ns.store(prev, Ordering::Relaxed);
}

/// Poll the per-CPU offset map; once any CPU proved its offsets,
/// broadcast them to all CPUs, detach the inference-phase probes and move
/// to STOP. From there an external `start()` brings the tracer up.
fn check_kern_adapt(inner: &Inner) {
    let proven = {
        let map = inner.offsets_map.lock().unwrap_or_else(|e| e.into_inner());
        match offset::collect_offsets(&map) {
            Ok(per_cpu) => offset::find_ready(&per_cpu),
            Err(e) => {
                log::warn!("offset map read failed: {e}");
                None
            }
        }
    };
    let Some(proven) = proven else {
        return;
    };

    {
        let mut map = inner.offsets_map.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = offset::broadcast_offsets(&mut map, proven, inner.nr_cpus) {
            log::warn!("offset broadcast failed: {e}");
            return;
        }
    }
    inner.proven_offsets.store(Some(Arc::new(proven)));

    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    let mut probes = inner.probes.lock().unwrap_or_else(|e| e.into_inner());
    match detach_probes(&mut probes) {
        Ok(()) => {
            *state = TracerState::Stop;
            inner.adapt_success.store(true, Ordering::Relaxed);
            let (major, minor) = capability::check_kernel_version().unwrap_or((0, 0));
            log::info!("Linux {major}.{minor} adapt success, state STOP");
        }
        Err(e) => log::warn!("detach after adaptation failed: {e}"),
    }
}

/// Cross-CPU totals of the kernel-side occupancy counters.
pub(crate) fn collect_trace_stats(inner: &Inner) -> TraceStats {
    let map = inner.stats_map.lock().unwrap_or_else(|e| e.into_inner());
    let mut total = TraceStats::default();
    if let Ok(values) = map.get(&0, 0) {
        for v in values.iter() {
            total.socket_map_count += v.socket_map_count;
            total.trace_map_count += v.trace_map_count;
            total.socket_map_drops += v.socket_map_drops;
            total.trace_map_drops += v.trace_map_drops;
        }
    }
    total
}

fn check_map_exceeded(inner: &Inner) {
    let totals = collect_trace_stats(inner);

    // The kernel counters never see userspace deletions; calibrate with
    // the cumulative reclaim counts before comparing.
    let socket_used =
        totals.socket_map_count - inner.socket_reclaim_count.load(Ordering::Relaxed) as i64;
    if socket_used >= inner.config.socket_map_max_reclaim as i64 {
        log::info!(
            "socket map used {socket_used} exceeds reclaim threshold {}, reclaiming",
            inner.config.socket_map_max_reclaim
        );
        reclaim_socket_map(inner, SOCKET_RECLAIM_TIMEOUT_SECS);
    }

    let trace_used =
        totals.trace_map_count - inner.trace_reclaim_count.load(Ordering::Relaxed) as i64;
    let trace_threshold = inner.config.trace_map_reclaim_threshold();
    if trace_used >= trace_threshold as i64 {
        log::info!(
            "trace map used {trace_used} exceeds reclaim threshold {trace_threshold}, reclaiming"
        );
        reclaim_trace_map(inner, TRACE_RECLAIM_TIMEOUT_SECS);
    }
}

/// Idleness rule shared by both maps: an entry whose last activity is
/// more than `timeout` seconds behind the current uptime is stale.
/// `timeout == 0` marks everything stale (the full-clear case).
#[inline]
fn is_stale(uptime: u64, update_time: u32, timeout: u64) -> bool {
    timeout == 0 || uptime.saturating_sub(update_time as u64) > timeout
}

/// Evict socket sessions idle longer than `timeout` seconds.
/// `timeout == 0` clears everything, which is what `stop()` wants.
pub(crate) fn reclaim_socket_map(inner: &Inner, timeout: u64) {
    let uptime = time::uptime_secs();
    let mut map = inner.socket_map.lock().unwrap_or_else(|e| e.into_inner());

    let stale: Vec<u64> = map
        .iter()
        .filter_map(|entry| entry.ok())
        .filter(|(_, v)| is_stale(uptime, v.update_time, timeout))
        .map(|(k, _)| k)
        .collect();

    let mut reclaimed = 0u64;
    for key in &stale {
        if map.remove(key).is_ok() {
            reclaimed += 1;
        }
    }
    inner
        .socket_reclaim_count
        .fetch_add(reclaimed, Ordering::Relaxed);
    log::info!("socket map reclaimed {reclaimed} entries");
}

/// Evict thread traces idle longer than `timeout` seconds.
pub(crate) fn reclaim_trace_map(inner: &Inner, timeout: u64) {
    let uptime = time::uptime_secs();
    let mut map = inner.trace_map.lock().unwrap_or_else(|e| e.into_inner());

    let stale: Vec<u64> = map
        .iter()
        .filter_map(|entry| entry.ok())
        .filter(|(_, v)| is_stale(uptime, v.update_time, timeout))
        .map(|(k, _)| k)
        .collect();

    let mut reclaimed = 0u64;
    for key in &stale {
        if map.remove(key).is_ok() {
            reclaimed += 1;
        }
    }
    inner
        .trace_reclaim_count
        .fetch_add(reclaimed, Ordering::Relaxed);
    log::info!("trace map reclaimed {reclaimed} entries");
}

#[cfg(test)]
mod tests {
    use super::is_stale;

    #[test]
    fn idle_threshold_drives_eviction() {
        // Entry touched at t=100, now t=105: inside the 10s window.
        assert!(!is_stale(105, 100, 10));
        // Exactly at the threshold is still alive.
        assert!(!is_stale(110, 100, 10));
        // One second past, evicted.
        assert!(is_stale(111, 100, 10));
    }

    #[test]
    fn zero_timeout_clears_everything() {
        assert!(is_stale(100, 100, 0));
        assert!(is_stale(0, 0, 0));
        assert!(is_stale(50, 100, 0));
    }

    #[test]
    fn clock_skew_does_not_underflow() {
        // update_time ahead of uptime (per-CPU clock wobble) must not
        // wrap into a huge idle age.
        assert!(!is_stale(99, 100, 10));
    }
}
