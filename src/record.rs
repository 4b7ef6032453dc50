//! User-facing records and the wire parsing that produces them.
//!
//! A perf sample is either a staging-buffer burst (leading u32 below
//! `EVENT_TYPE_MIN` = number of events) or a registered extra event. All
//! socket records of one burst share a single `Bytes` backing block; each
//! record holds a zero-copy slice into it, and the block is released when
//! the last consumer drops its record.

use bytes::{BufMut, Bytes, BytesMut};

use socktrace_ebpf_common::{
    ProcessEvent, SocketDataHeader, Tuple, EVENT_BURST_NUM, SOCKET_DATA_HEADER_SIZE,
};

/// One L4/L7 capture event as delivered to the user callback.
#[derive(Clone)]
pub struct SocketRecord {
    /// Wall-clock microseconds of the capture.
    pub timestamp_us: u64,
    pub tuple: Tuple,
    pub direction: u8,
    pub l7_protocol_hint: u16,
    /// Whether the upper layer should re-run protocol inference. Always
    /// false for now; the kernel-side reconfirm state machine handles it.
    pub need_reconfirm: bool,
    pub msg_type: u8,
    pub process_id: u32,
    pub thread_id: u32,
    pub coroutine_id: u64,
    pub process_name: [u8; 16],
    /// Durable session id; unique within a boot.
    pub socket_id: u64,
    /// Per-session capture sequence; repeats only for fragments that
    /// continue the previous record.
    pub cap_seq: u64,
    pub tcp_seq: u32,
    /// Trace id pairing this record with its cross-socket counterpart on
    /// the same thread; 0 when unpaired.
    pub syscall_trace_id_call: u64,
    /// Full syscall byte count (including prestore carry-over).
    pub syscall_len: u64,
    pub cap_len: u32,
    cap_data: Bytes,
}

impl SocketRecord {
    /// Captured payload prefix, at most `CAP_DATA_SIZE` (+4 carry) bytes.
    pub fn cap_data(&self) -> &[u8] {
        &self.cap_data
    }

    /// Process name with the kernel's NUL padding stripped.
    pub fn process_name_str(&self) -> &str {
        let end = self
            .process_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.process_name.len());
        std::str::from_utf8(&self.process_name[..end]).unwrap_or("")
    }
}

impl std::fmt::Debug for SocketRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRecord")
            .field("socket_id", &self.socket_id)
            .field("cap_seq", &self.cap_seq)
            .field("direction", &self.direction)
            .field("msg_type", &self.msg_type)
            .field("l7_protocol_hint", &self.l7_protocol_hint)
            .field("trace_id", &self.syscall_trace_id_call)
            .field("process", &self.process_name_str())
            .field("cap_len", &self.cap_len)
            .finish()
    }
}

/// Process exec/exit notification for registered event handlers.
#[derive(Clone, Copy, Debug)]
pub struct ProcessEventRecord {
    pub event_type: u32,
    pub pid: u32,
    pub name: [u8; 16],
}

impl ProcessEventRecord {
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Leading u32 of a perf sample: burst event count or extra event type.
pub fn sample_discriminator(raw: &[u8]) -> Option<u32> {
    if raw.len() < 4 {
        return None;
    }
    Some(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Parse a registered extra event.
pub fn parse_process_event(raw: &[u8]) -> Option<ProcessEventRecord> {
    if raw.len() < std::mem::size_of::<ProcessEvent>() {
        return None;
    }
    let ev = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ProcessEvent) };
    Some(ProcessEventRecord {
        event_type: ev.event_type,
        pid: ev.pid,
        name: ev.name,
    })
}

/// Parse a staging-buffer burst into records appended to `out`.
///
/// Records borrow from `raw`; the prestore carry case is the one copy
/// (4 stashed bytes must be prepended to the payload).
pub fn parse_burst(
    raw: &Bytes,
    boot_time_ns: u64,
    out: &mut Vec<SocketRecord>,
) -> Result<u32, &'static str> {
    if raw.len() < 8 {
        return Err("burst shorter than its prefix");
    }
    let events_num = u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if events_num == 0 || events_num > EVENT_BURST_NUM {
        return Err("implausible burst event count");
    }

    let mut off = 8usize;
    let mut parsed = 0u32;

    for _ in 0..events_num {
        if off + SOCKET_DATA_HEADER_SIZE > raw.len() {
            return Err("burst truncated inside a record header");
        }
        let header = unsafe {
            std::ptr::read_unaligned(raw[off..].as_ptr() as *const SocketDataHeader)
        };
        let data_len = header.data_len as usize;
        let payload_start = off + SOCKET_DATA_HEADER_SIZE;
        if payload_start + data_len > raw.len() {
            return Err("burst truncated inside a record payload");
        }

        let extra_count = header.extra_data_count;
        let (cap_data, cap_len) = if extra_count > 0 {
            let mut buf = BytesMut::with_capacity(4 + data_len);
            buf.put_slice(&header.extra_data.to_ne_bytes());
            buf.put_slice(&raw[payload_start..payload_start + data_len]);
            (buf.freeze(), data_len as u32 + extra_count)
        } else {
            (
                raw.slice(payload_start..payload_start + data_len),
                data_len as u32,
            )
        };

        let tuple: Tuple = header.tuple;
        out.push(SocketRecord {
            timestamp_us: header.timestamp.wrapping_add(boot_time_ns) / 1000,
            tuple,
            direction: header.direction,
            l7_protocol_hint: header.data_type,
            need_reconfirm: false,
            msg_type: header.msg_type,
            process_id: header.tgid,
            thread_id: header.pid,
            coroutine_id: header.coroutine_id,
            process_name: header.comm,
            socket_id: header.socket_id,
            cap_seq: header.data_seq,
            tcp_seq: header.tcp_seq,
            syscall_trace_id_call: header.thread_trace_id,
            syscall_len: header.syscall_len + extra_count as u64,
            cap_len,
            cap_data,
        });

        off = payload_start + data_len;
        parsed += 1;
    }

    Ok(parsed)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for synthetic wire buffers.

    use super::*;
    use socktrace_ebpf_common::{MSG_REQUEST, PROTO_HTTP1, T_EGRESS};

    pub fn comm(name: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        let n = name.len().min(15);
        out[..n].copy_from_slice(&name.as_bytes()[..n]);
        out
    }

    pub fn header_template() -> SocketDataHeader {
        SocketDataHeader {
            pid: 1001,
            tgid: 1000,
            coroutine_id: 0,
            comm: comm("curl"),
            socket_id: 42,
            tuple: Tuple {
                daddr: [0; 16],
                saddr: [0; 16],
                addr_len: 4,
                l4_protocol: 6,
                dport: 80,
                num: 50000,
            },
            extra_data: 0,
            extra_data_count: 0,
            tcp_seq: 1,
            thread_trace_id: 0,
            timestamp: 1_000_000_000,
            direction: T_EGRESS,
            msg_type: MSG_REQUEST,
            syscall_len: 0,
            data_seq: 0,
            data_type: PROTO_HTTP1,
            data_len: 0,
        }
    }

    /// Serialize records into the staging-buffer wire form.
    pub fn build_burst(records: &[(SocketDataHeader, &[u8])]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_ne(records.len() as u32);
        let mut len = 0u32;
        for (_, payload) in records {
            len += (SOCKET_DATA_HEADER_SIZE + payload.len()) as u32;
        }
        buf.put_u32_ne(len);
        for (header, payload) in records {
            let mut h = *header;
            h.data_len = payload.len() as u16;
            h.syscall_len = payload.len() as u64;
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &h as *const SocketDataHeader as *const u8,
                    SOCKET_DATA_HEADER_SIZE,
                )
            };
            buf.put_slice(bytes);
            buf.put_slice(payload);
        }
        buf.freeze()
    }
}
