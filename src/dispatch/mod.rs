//! Perf reader and work dispatch.
//!
//! One reader thread drains every per-CPU perf ring, unpacks burst
//! buffers into records, and shards them across bounded worker queues by
//! session id, so all records of one session are consumed in order by a
//! single worker. Registered extra events (process exec/exit) shard by
//! event type instead and also feed the internal process-events thread.

use std::hash::Hasher;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use aya::maps::perf::PerfEventArray;
use aya::maps::MapData;
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use rustc_hash::FxHasher;

use socktrace_ebpf_common::{EVENT_TYPE_MIN, SOCKET_BUFFER_SIZE};

use crate::error::TracerError;
use crate::record::{
    parse_burst, parse_process_event, sample_discriminator, ProcessEventRecord, SocketRecord,
};
use crate::stats::QueueCounters;
use crate::{EventHandle, L7Handle};

/// Spare room beyond the staging buffer for the perf sample header.
const PERF_READ_CAPACITY: usize = SOCKET_BUFFER_SIZE + 256;

/// Samples aya can hand back from one `read_events` call.
const READ_BATCH: usize = 16;

const POLL_TIMEOUT_MS: i32 = 200;
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Unit of work consumed by the worker pool.
pub enum WorkItem {
    Socket(SocketRecord),
    Event(ProcessEventRecord, EventHandle),
}

/// Extra-event subscriptions; matching is by bit intersection so one
/// handler can subscribe to several event types.
pub type EventRegistry = Arc<RwLock<Vec<(u32, EventHandle)>>>;

#[inline]
fn shard(key: u64, count: usize) -> usize {
    let mut h = FxHasher::default();
    h.write_u64(key);
    (h.finish() % count as u64) as usize
}

/// Everything the reader thread owns.
pub struct ReaderCtx {
    pub perf: PerfEventArray<MapData>,
    pub perf_pages: usize,
    pub cpus: Vec<u32>,
    pub boot_time_ns: Arc<AtomicU64>,
    pub kern_lost: Arc<AtomicU64>,
    pub senders: Vec<Sender<WorkItem>>,
    pub counters: Vec<Arc<QueueCounters>>,
    pub events: EventRegistry,
    pub proc_tx: Sender<ProcessEventRecord>,
    pub shutdown: Arc<AtomicBool>,
}

/// Spawn the reader thread; it exits when `shutdown` flips.
pub fn spawn_reader(mut ctx: ReaderCtx) -> Result<JoinHandle<()>, TracerError> {
    let mut rings = Vec::with_capacity(ctx.cpus.len());
    for &cpu in &ctx.cpus {
        let ring = ctx
            .perf
            .open(cpu, Some(ctx.perf_pages))
            .map_err(|e| TracerError::Perf(format!("open perf ring on cpu {cpu}: {e}")))?;
        rings.push(ring);
    }

    std::thread::Builder::new()
        .name("sktrace-reader".into())
        .spawn(move || reader_loop(&mut ctx, rings))
        .map_err(TracerError::Thread)
}

fn reader_loop<T: std::borrow::BorrowMut<MapData>>(
    ctx: &mut ReaderCtx,
    mut rings: Vec<aya::maps::perf::PerfEventArrayBuffer<T>>,
) {
    let mut read_bufs: Vec<BytesMut> = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(PERF_READ_CAPACITY))
        .collect();
    let mut records: Vec<SocketRecord> = Vec::with_capacity(64);

    while !ctx.shutdown.load(Ordering::Relaxed) {
        let mut pollfds: Vec<libc::pollfd> = rings
            .iter()
            .map(|r| libc::pollfd {
                fd: r.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if ready <= 0 {
            continue;
        }

        for (i, pfd) in pollfds.iter().enumerate() {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let events = match rings[i].read_events(&mut read_bufs) {
                Ok(ev) => ev,
                Err(e) => {
                    log::warn!("perf read on ring {i}: {e}");
                    continue;
                }
            };
            if events.lost > 0 {
                ctx.kern_lost.fetch_add(events.lost as u64, Ordering::Relaxed);
            }
            for buf in read_bufs.iter_mut().take(events.read) {
                let raw = buf.split().freeze();
                dispatch_sample(ctx, raw, &mut records);
                if buf.capacity() < PERF_READ_CAPACITY {
                    *buf = BytesMut::with_capacity(PERF_READ_CAPACITY);
                }
            }
        }
    }
}

fn dispatch_sample(ctx: &ReaderCtx, raw: bytes::Bytes, records: &mut Vec<SocketRecord>) {
    let Some(discriminator) = sample_discriminator(&raw) else {
        return;
    };
    if discriminator == 0 {
        return;
    }

    if discriminator >= EVENT_TYPE_MIN {
        dispatch_extra_event(ctx, &raw);
        return;
    }

    records.clear();
    if let Err(reason) = parse_burst(&raw, ctx.boot_time_ns.load(Ordering::Relaxed), records) {
        log::warn!("dropping perf sample: {reason}");
        return;
    }

    let n = ctx.senders.len();
    let mut touched = [false; 64];
    for rec in records.drain(..) {
        let q = shard(rec.socket_id, n);
        if q < touched.len() && !touched[q] {
            touched[q] = true;
            ctx.counters[q].inc_burst();
        }
        match ctx.senders[q].try_send(WorkItem::Socket(rec)) {
            Ok(()) => ctx.counters[q].add_enqueue(1),
            Err(TrySendError::Full(_)) => ctx.counters[q].add_enqueue_lost(1),
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
    // The burst's backing block is released when the last enqueued
    // record is consumed; a full loss drops it right here.
}

fn dispatch_extra_event(ctx: &ReaderCtx, raw: &[u8]) {
    let Some(event) = parse_process_event(raw) else {
        log::warn!("malformed extra event of {} bytes", raw.len());
        return;
    };

    // Internal consumer first (process lifecycle bookkeeping).
    let _ = ctx.proc_tx.try_send(event);

    let handler = {
        let registry = ctx.events.read().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .find(|(mask, _)| mask & event.event_type != 0)
            .map(|(_, h)| h.clone())
    };
    let Some(handler) = handler else {
        return;
    };

    let q = shard(event.event_type as u64, ctx.senders.len());
    match ctx.senders[q].try_send(WorkItem::Event(event, handler)) {
        Ok(()) => ctx.counters[q].add_enqueue(1),
        Err(TrySendError::Full(_)) => ctx.counters[q].add_enqueue_lost(1),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Spawn the worker pool; each worker owns one queue receiver.
pub fn spawn_workers(
    thread_nr: usize,
    queue_size: usize,
    handle: L7Handle,
    counters: &[Arc<QueueCounters>],
    shutdown: Arc<AtomicBool>,
) -> Result<(Vec<Sender<WorkItem>>, Vec<JoinHandle<()>>), TracerError> {
    let mut senders = Vec::with_capacity(thread_nr);
    let mut handles = Vec::with_capacity(thread_nr);

    for i in 0..thread_nr {
        let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(queue_size);
        let worker_handle = handle.clone();
        let worker_counters = counters[i].clone();
        let worker_shutdown = shutdown.clone();
        let h = std::thread::Builder::new()
            .name(format!("sktrace-worker-{i}"))
            .spawn(move || worker_loop(rx, worker_handle, worker_counters, worker_shutdown))
            .map_err(TracerError::Thread)?;
        senders.push(tx);
        handles.push(h);
    }

    Ok((senders, handles))
}

fn worker_loop(
    rx: Receiver<WorkItem>,
    handle: L7Handle,
    counters: Arc<QueueCounters>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(WorkItem::Socket(rec)) => {
                counters.inc_dequeue();
                handle(rec);
            }
            Ok(WorkItem::Event(event, f)) => {
                counters.inc_dequeue();
                f(event);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Internal process-events consumer. The Go uprobe collaborator hooks its
/// exec/exit reconciliation here; the core only logs.
pub fn spawn_process_events(
    rx: Receiver<ProcessEventRecord>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, TracerError> {
    std::thread::Builder::new()
        .name("sktrace-proc-events".into())
        .spawn(move || loop {
            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => {
                    log::debug!(
                        "process event type {} pid {} comm {}",
                        event.event_type,
                        event.pid,
                        event.name_str()
                    );
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        })
        .map_err(TracerError::Thread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_stable_and_in_range() {
        for count in [1usize, 2, 4, 7] {
            for key in [0u64, 1, 42, u64::MAX] {
                let a = shard(key, count);
                let b = shard(key, count);
                assert_eq!(a, b);
                assert!(a < count);
            }
        }
    }

    #[test]
    fn same_session_always_lands_on_one_queue() {
        let q = shard(0xdead_beef, 4);
        for _ in 0..100 {
            assert_eq!(shard(0xdead_beef, 4), q);
        }
    }
}
