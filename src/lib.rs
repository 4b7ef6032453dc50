//! Socket tracer — an eBPF engine that reconstructs L4/L7
//! request/response events from every process on the host.
//!
//! Kernel-side programs attach to syscall tracepoints and selected
//! kprobes, classify each fd's socket, infer the L7 protocol from the
//! first payload bytes, stamp a per-thread trace id that pairs ingress
//! and egress of one logical request, and batch records through a
//! per-CPU staging buffer into a perf channel. Userspace proves kernel
//! struct offsets with a loopback exchange, reads the perf channel,
//! shards records across a worker pool by session, and bounds the shared
//! maps with time-based reclamation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use socktrace::{SocketTracer, TracerConfig};
//!
//! let tracer = SocketTracer::run(
//!     TracerConfig::default(),
//!     Arc::new(|rec| println!("{rec:?}")),
//! )?;
//! // INIT → STOP happens once kernel adaptation succeeds; then:
//! while !tracer.is_adapt_success() {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! tracer.start()?;
//! # Ok::<(), socktrace::TracerError>(())
//! ```

pub mod capability;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod offset;
pub mod record;
pub mod stats;
pub mod time;
pub mod tracer;

mod reclaim;

pub use config::TracerConfig;
pub use error::TracerError;
pub use record::{ProcessEventRecord, SocketRecord};
pub use stats::{QueueCounters, SocketTraceStats, SocketTracerShow, TracerState};
pub use tracer::SocketTracer;

/// Re-exported wire types shared with the kernel programs.
pub use socktrace_ebpf_common as common;

use std::sync::Arc;

/// Callback invoked by a worker thread for every delivered record.
pub type L7Handle = Arc<dyn Fn(SocketRecord) + Send + Sync>;

/// Callback for registered extra events (process exec/exit).
pub type EventHandle = Arc<dyn Fn(ProcessEventRecord) + Send + Sync>;

/// One-shot bring-up, free-function form. See [`SocketTracer::run`].
pub fn running_socket_tracer(
    handle: L7Handle,
    config: TracerConfig,
) -> Result<SocketTracer, TracerError> {
    SocketTracer::run(config, handle)
}
