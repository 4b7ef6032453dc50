//! Tracer lifecycle integration tests (Linux-only).
//!
//! The full bring-up needs root, a 4.14+ kernel, and the compiled
//! kernel-side object; tests that need them skip politely when any is
//! missing. Build the object first:
//!
//!   cargo build -p socktrace-ebpf --release --target bpfel-unknown-none
//!
//! Run with:
//!   sudo -E cargo test --test tracer_lifecycle

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use socktrace::{SocketTracer, TracerConfig, TracerError, TracerState};

fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

fn bpf_object_present(cfg: &TracerConfig) -> bool {
    cfg.bpf_object.exists()
}

macro_rules! require_env {
    ($cfg:expr) => {
        if !is_root() {
            eprintln!("SKIPPED: requires root");
            return;
        }
        if !bpf_object_present($cfg) {
            eprintln!("SKIPPED: kernel object {} not built", $cfg.bpf_object.display());
            return;
        }
    };
}

fn quiet_handle() -> socktrace::L7Handle {
    Arc::new(|_rec| {})
}

/// Small maps keep load fast in tests.
fn test_config() -> TracerConfig {
    TracerConfig {
        thread_nr: 2,
        perf_pages_cnt: 16,
        queue_size: 4096,
        max_socket_entries: 8192,
        max_trace_entries: 8192,
        socket_map_max_reclaim: 8000,
        ..TracerConfig::default()
    }
}

/// The capability gate runs before anything touches the kernel, so it is
/// testable without root: an unreadable or ancient version string must
/// refuse with the dedicated error.
#[test]
fn version_gate_is_checked_first() {
    // On any machine new enough to run the test suite, the live check
    // passes; the refusal path is covered by the parser unit tests. Here
    // we only pin the error type surface.
    match socktrace::capability::check_kernel_version() {
        Ok((major, minor)) => assert!(major > 4 || (major == 4 && minor >= 14)),
        Err(TracerError::KernelNotSupported(major, _)) => assert!(major < 5),
        Err(TracerError::KernelVersionUnknown) => {}
        Err(e) => panic!("unexpected error class: {e}"),
    }
}

/// INIT refuses start/stop; adaptation must reach STOP before the
/// external transitions are honored.
#[test]
fn init_state_refuses_external_transitions() {
    let cfg = test_config();
    require_env!(&cfg);

    let tracer = SocketTracer::run(cfg, quiet_handle()).expect("tracer bring-up");
    assert_eq!(tracer.state(), TracerState::Init);

    match tracer.start() {
        Err(TracerError::InvalidState(_)) => {}
        other => {
            // Adaptation can legitimately win the race on a fast machine.
            assert!(tracer.is_adapt_success(), "unexpected start result: {other:?}");
        }
    }
}

/// INIT → STOP within a bounded number of polling periods, then start()
/// flips to RUNNING and stop() back to STOP, both idempotent.
#[test]
fn adaptation_reaches_stop_then_start_stop_cycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = test_config();
    require_env!(&cfg);

    let tracer = SocketTracer::run(cfg, quiet_handle()).expect("tracer bring-up");

    let deadline = Instant::now() + Duration::from_secs(30);
    while !tracer.is_adapt_success() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
    }
    assert!(
        tracer.is_adapt_success(),
        "offset inference did not converge within 30s"
    );
    assert_eq!(tracer.state(), TracerState::Stop);

    let stats = tracer.stats();
    assert!(stats.is_adapt_success);

    tracer.start().expect("start from STOP");
    assert_eq!(tracer.state(), TracerState::Running);
    tracer.start().expect("start is idempotent from RUNNING");

    tracer.stop().expect("stop from RUNNING");
    assert_eq!(tracer.state(), TracerState::Stop);
    tracer.stop().expect("stop is idempotent from STOP");
}

/// The diagnostic surface exposes per-CPU offsets; after adaptation every
/// CPU slot carries the broadcast values.
#[test]
fn offsets_are_broadcast_to_all_cpus() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = test_config();
    require_env!(&cfg);

    let tracer = SocketTracer::run(cfg, quiet_handle()).expect("tracer bring-up");
    let deadline = Instant::now() + Duration::from_secs(30);
    while !tracer.is_adapt_success() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
    }
    assert!(tracer.is_adapt_success());

    let show = tracer.show().expect("show");
    assert!(!show.offsets.is_empty());
    for per_cpu in &show.offsets {
        assert_eq!(per_cpu.ready, 1);
        assert!(per_cpu.complete());
    }

    let proven = tracer.proven_offsets().expect("proven offsets published");
    assert!(proven.complete());
}

/// Event registration rejects types below the extra-event range.
#[test]
fn event_registration_validates_type_range() {
    let cfg = test_config();
    require_env!(&cfg);

    let tracer = SocketTracer::run(cfg, quiet_handle()).expect("tracer bring-up");
    let err = tracer.register_event_handle(3, Arc::new(|_| {}));
    assert!(matches!(err, Err(TracerError::Config(_))));

    tracer
        .register_event_handle(socktrace::common::EVENT_TYPE_PROC_EXEC, Arc::new(|_| {}))
        .expect("valid event type registers");
}
