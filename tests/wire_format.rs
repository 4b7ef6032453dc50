//! Wire-format and dispatch integration tests.
//!
//! Exercises the kernel/userspace contract without a kernel: byte layout
//! of the shared structs, burst parsing, session sharding, and the worker
//! pool delivering records in per-session order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socktrace::common::{
    conn_key, MemberOffsets, ProcessEvent, SocketData, SocketDataBuffer, SocketDataHeader,
    SocketInfo, TraceInfo, TraceStats, TraceUid, Tuple, CAP_DATA_SIZE, MSG_REQUEST, MSG_RESPONSE,
    PROTO_HTTP1, SOCKET_BUFFER_SIZE, SOCKET_DATA_HEADER_SIZE, T_EGRESS, T_INGRESS,
};
use socktrace::dispatch::{spawn_workers, WorkItem};
use socktrace::record::{parse_burst, SocketRecord};
use socktrace::stats::QueueCounters;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn comm(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = name.len().min(15);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

fn header(socket_id: u64, seq: u64, direction: u8, msg_type: u8) -> SocketDataHeader {
    SocketDataHeader {
        pid: 2001,
        tgid: 2000,
        coroutine_id: 0,
        comm: comm("testproc"),
        socket_id,
        tuple: Tuple {
            daddr: [0; 16],
            saddr: [0; 16],
            addr_len: 4,
            l4_protocol: 6,
            dport: 80,
            num: 41000,
        },
        extra_data: 0,
        extra_data_count: 0,
        tcp_seq: 100,
        thread_trace_id: 0,
        timestamp: 1_000,
        direction,
        msg_type,
        syscall_len: 0,
        data_seq: seq,
        data_type: PROTO_HTTP1,
        data_len: 0,
    }
}

/// Serialize records the way the kernel staging buffer lays them out.
fn build_burst(records: &[(SocketDataHeader, &[u8])]) -> bytes::Bytes {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(records.len() as u32).to_ne_bytes());
    let len: usize = records
        .iter()
        .map(|(_, p)| SOCKET_DATA_HEADER_SIZE + p.len())
        .sum();
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    for (h, payload) in records {
        let mut h = *h;
        h.data_len = payload.len() as u16;
        h.syscall_len = payload.len() as u64;
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &h as *const SocketDataHeader as *const u8,
                SOCKET_DATA_HEADER_SIZE,
            )
        };
        buf.extend_from_slice(bytes);
        buf.extend_from_slice(payload);
    }
    bytes::Bytes::from(buf)
}

// ---------------------------------------------------------------------------
// Layout — kernel and userspace must agree byte for byte
// ---------------------------------------------------------------------------

#[test]
fn shared_struct_layout() {
    assert_eq!(std::mem::size_of::<Tuple>(), 38);
    assert_eq!(std::mem::size_of::<SocketDataHeader>(), 128);
    assert_eq!(std::mem::size_of::<SocketData>(), 128 + CAP_DATA_SIZE);
    assert_eq!(std::mem::size_of::<SocketDataBuffer>(), SOCKET_BUFFER_SIZE);
    assert!(SOCKET_BUFFER_SIZE.is_power_of_two());
    assert_eq!(std::mem::size_of::<SocketInfo>(), 56);
    assert_eq!(std::mem::size_of::<TraceInfo>(), 24);
    assert_eq!(std::mem::size_of::<TraceUid>(), 16);
    assert_eq!(std::mem::size_of::<TraceStats>(), 32);
    assert_eq!(std::mem::size_of::<MemberOffsets>(), 20);
    assert_eq!(std::mem::size_of::<ProcessEvent>(), 24);
}

#[test]
fn conn_key_packs_tgid_and_fd() {
    assert_eq!(conn_key(1, 2), (1u64 << 32) | 2);
    assert_eq!(conn_key(0xffff_ffff, 0xffff_ffff), u64::MAX);
    assert_ne!(conn_key(1, 2), conn_key(2, 1));
}

// ---------------------------------------------------------------------------
// Burst parsing
// ---------------------------------------------------------------------------

#[test]
fn burst_of_sixteen_parses_in_order() {
    let payload = b"GET / HTTP/1.1\r\n";
    let records: Vec<(SocketDataHeader, &[u8])> = (0..16)
        .map(|i| (header(7, i as u64 + 1, T_EGRESS, MSG_REQUEST), &payload[..]))
        .collect();
    let raw = build_burst(&records);

    let mut out = Vec::new();
    let n = parse_burst(&raw, 0, &mut out).unwrap();
    assert_eq!(n, 16);
    for (i, rec) in out.iter().enumerate() {
        assert_eq!(rec.cap_seq, i as u64 + 1);
        assert_eq!(rec.socket_id, 7);
        assert_eq!(rec.cap_data(), payload);
    }
}

#[test]
fn uid_survives_roundtrip_per_record() {
    let raw = build_burst(&[
        (header(11, 1, T_EGRESS, MSG_REQUEST), b"GET / HTTP/1.1\r\n"),
        (header(12, 1, T_INGRESS, MSG_RESPONSE), b"HTTP/1.1 200 OK\r\n"),
    ]);
    let mut out = Vec::new();
    parse_burst(&raw, 0, &mut out).unwrap();
    assert_eq!(out[0].socket_id, 11);
    assert_eq!(out[1].socket_id, 12);
}

// ---------------------------------------------------------------------------
// Worker pool — sharded delivery preserves per-session order
// ---------------------------------------------------------------------------

fn records_for_sessions(sessions: &[u64], per_session: u64) -> Vec<SocketRecord> {
    let mut headers = Vec::new();
    for seq in 1..=per_session {
        for &sid in sessions {
            headers.push((header(sid, seq, T_EGRESS, MSG_REQUEST), b"GET /ord\r\n" as &[u8]));
        }
    }
    let mut out = Vec::new();
    // Build in burst-sized chunks the way the reader would see them.
    for chunk in headers.chunks(16) {
        let raw = build_burst(chunk);
        parse_burst(&raw, 0, &mut out).unwrap();
    }
    out
}

#[test]
fn workers_preserve_per_session_sequence() {
    let delivered: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();

    let counters: Vec<Arc<QueueCounters>> =
        (0..2).map(|_| Arc::new(QueueCounters::default())).collect();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (senders, handles) = spawn_workers(
        2,
        1024,
        Arc::new(move |rec| {
            sink.lock().unwrap().push((rec.socket_id, rec.cap_seq));
        }),
        &counters,
        shutdown.clone(),
    )
    .unwrap();

    // All records of one session go to one queue; alternate sessions
    // across the two queues the way the reader's shard function would.
    let records = records_for_sessions(&[100, 200, 300, 400], 50);
    for rec in records {
        let q = (rec.socket_id / 100 % 2) as usize;
        senders[q].send(WorkItem::Socket(rec)).unwrap();
        counters[q].add_enqueue(1);
    }

    // Drain.
    std::thread::sleep(Duration::from_millis(300));
    shutdown.store(true, Ordering::Relaxed);
    drop(senders);
    for h in handles {
        h.join().unwrap();
    }

    let seen = delivered.lock().unwrap();
    assert_eq!(seen.len(), 4 * 50);

    // Within each session, sequences must arrive strictly increasing.
    for &sid in &[100u64, 200, 300, 400] {
        let seqs: Vec<u64> = seen.iter().filter(|(s, _)| *s == sid).map(|(_, q)| *q).collect();
        assert_eq!(seqs.len(), 50);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "session {sid} out of order");
    }

    let dequeued: u64 = counters.iter().map(|c| c.dequeue_nr.load(Ordering::Relaxed)).sum();
    assert_eq!(dequeued, 200);
}

#[test]
fn full_queue_counts_losses_not_panics() {
    let counters: Vec<Arc<QueueCounters>> =
        vec![Arc::new(QueueCounters::default())];
    let shutdown = Arc::new(AtomicBool::new(false));

    // A handler that blocks until told, so the queue backs up.
    let gate = Arc::new(AtomicBool::new(false));
    let handler_gate = gate.clone();
    let (senders, handles) = spawn_workers(
        1,
        4,
        Arc::new(move |_rec| {
            while !handler_gate.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }),
        &counters,
        shutdown.clone(),
    )
    .unwrap();

    let records = records_for_sessions(&[9], 16);
    let mut lost = 0u64;
    for rec in records {
        match senders[0].try_send(WorkItem::Socket(rec)) {
            Ok(()) => counters[0].add_enqueue(1),
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                counters[0].add_enqueue_lost(1);
                lost += 1;
            }
            Err(e) => panic!("unexpected send error: {e}"),
        }
    }
    assert!(lost > 0, "queue of 4 must overflow with 16 sends");
    assert_eq!(counters[0].enqueue_lost.load(Ordering::Relaxed), lost);

    gate.store(true, Ordering::Relaxed);
    shutdown.store(true, Ordering::Relaxed);
    drop(senders);
    for h in handles {
        h.join().unwrap();
    }
}
