//! Per-event connection context assembled on the probe stack.

use socktrace_ebpf_common::SocketInfo;

/// Everything the submit path needs to know about the syscall's socket.
/// Built fresh in each exit handler; `socket_info` points at the live map
/// entry (null when the session has no entry yet).
pub struct ConnInfo {
    pub sk: u64,
    pub fd: i32,
    pub conn_key: u64,
    pub socket_info: *mut SocketInfo,
    pub family: u16,
    pub l4_protocol: u8,
    pub dport: u16,
    pub sport: u16,
    pub direction: u8,
    pub protocol: u16,
    pub msg_type: u8,
    pub role: u8,
    pub need_reconfirm: bool,
    pub correlation_id: i32,
    /// Bytes stashed by a prestore read, consumed by this event.
    pub prev_buf: [u8; 4],
    pub prev_count: u32,
    /// Same-direction burst: reuse the previous sequence number.
    pub keep_data_seq: bool,
    /// Session protocol classified by an earlier event, if any.
    pub existing_l7: u16,
}

impl ConnInfo {
    pub fn new(sk: u64, fd: i32, conn_key: u64, direction: u8) -> Self {
        ConnInfo {
            sk,
            fd,
            conn_key,
            socket_info: core::ptr::null_mut(),
            family: 0,
            l4_protocol: 0,
            dport: 0,
            sport: 0,
            direction,
            protocol: 0,
            msg_type: 0,
            role: 0,
            need_reconfirm: false,
            correlation_id: -1,
            prev_buf: [0; 4],
            prev_count: 0,
            keep_data_seq: false,
            existing_l7: 0,
        }
    }
}
