//! L7 protocol inference over the first payload bytes of a syscall.
//!
//! Pure byte-pattern logic shared by the kernel programs (which run it on
//! a bounded stack sample) and the host test suite. Recognizers never
//! look past [`INFER_BUF_SIZE`] bytes; `count` is the full syscall length
//! and is used for length-prefix validation.
//!
//! A recognizer returns `(protocol, msg_type)`. Besides REQUEST/RESPONSE
//! there are three control outcomes:
//! - `MSG_PRESTORE`: payload too short to classify; the caller stashes up
//!   to 4 bytes and emits nothing.
//! - `MSG_RECONFIRM`: classification needs a later payload (Kafka
//!   correlation-id matching); nothing is emitted.
//! - `MSG_CLEAR`: the session contradicts its earlier classification; its
//!   state entry is deleted.

use crate::{
    IPPROTO_TCP, IPPROTO_UDP, MSG_CLEAR, MSG_PRESTORE, MSG_RECONFIRM, MSG_REQUEST, MSG_RESPONSE,
    MSG_UNKNOWN, PROTO_DNS, PROTO_DUBBO, PROTO_HTTP1, PROTO_HTTP2, PROTO_KAFKA, PROTO_MQTT,
    PROTO_MYSQL, PROTO_REDIS, PROTO_UNKNOWN, ROLE_CLIENT, ROLE_SERVER, ROLE_UNKNOWN, T_EGRESS,
    T_INGRESS,
};

/// Bytes sampled from the head of each payload for classification.
pub const INFER_BUF_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub protocol: u16,
    pub msg_type: u8,
}

pub const MESSAGE_UNKNOWN: ProtocolMessage = ProtocolMessage {
    protocol: PROTO_UNKNOWN,
    msg_type: MSG_UNKNOWN,
};

/// Per-event view of the session state the recognizers read and update.
/// The kernel side copies these fields out of `SocketInfo` before the call
/// and writes the mutated ones back afterwards.
#[derive(Clone, Copy, Debug)]
pub struct InferCtx {
    pub direction: u8,
    pub l4_protocol: u8,
    pub dport: u16,
    pub sport: u16,
    /// Protocol the session was classified as earlier, or `PROTO_UNKNOWN`.
    pub existing_l7: u16,
    pub role: u8,
    pub need_reconfirm: bool,
    /// Kafka request/response matching; -1 when unset.
    pub correlation_id: i32,
    /// Length-prefix bytes stashed by a prior prestore read.
    pub prev: [u8; 4],
    pub prev_len: u32,
}

impl InferCtx {
    /// Request/response orientation implied by role and direction, once
    /// the role is known.
    #[inline]
    fn msg_by_role(&self) -> u8 {
        match (self.role, self.direction) {
            (ROLE_CLIENT, T_EGRESS) | (ROLE_SERVER, T_INGRESS) => MSG_REQUEST,
            (ROLE_CLIENT, T_INGRESS) | (ROLE_SERVER, T_EGRESS) => MSG_RESPONSE,
            _ => MSG_UNKNOWN,
        }
    }

    /// Latch the role the first time a request or response is recognized.
    #[inline]
    fn settle_role(&mut self, msg_type: u8) {
        if self.role != ROLE_UNKNOWN {
            return;
        }
        self.role = match (self.direction, msg_type) {
            (T_EGRESS, MSG_REQUEST) | (T_INGRESS, MSG_RESPONSE) => ROLE_CLIENT,
            (T_INGRESS, MSG_REQUEST) | (T_EGRESS, MSG_RESPONSE) => ROLE_SERVER,
            _ => ROLE_UNKNOWN,
        };
    }
}

/// Classify one payload. Runs the full recognizer chain on the first
/// payload of a session; once classified, later events dispatch straight
/// to the session's protocol so per-event cost stays flat.
pub fn infer_protocol(sample: &[u8], count: usize, ctx: &mut InferCtx) -> ProtocolMessage {
    if count == 0 || sample.is_empty() {
        return MESSAGE_UNKNOWN;
    }

    // Stashed length-prefix bytes take precedence: the previous read was
    // a bare 4-byte header and this payload is its body.
    if ctx.prev_len == 4 {
        if let Some(m) = infer_mysql_with_prev(sample, count, ctx) {
            ctx.settle_role(m.msg_type);
            return m;
        }
        if let Some(m) = infer_kafka_with_prev(sample, count, ctx) {
            ctx.settle_role(m.msg_type);
            return m;
        }
        // The stash matched nothing; drop it and classify afresh.
        ctx.prev_len = 0;
    }

    let m = match ctx.existing_l7 {
        PROTO_UNKNOWN => infer_fresh(sample, count, ctx),
        PROTO_HTTP1 => infer_http1(sample, count).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_HTTP2 => infer_http2(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_DNS => infer_dns(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_MYSQL => infer_mysql(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_KAFKA => infer_kafka(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_REDIS => infer_redis(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_DUBBO => infer_dubbo(sample, count).unwrap_or(MESSAGE_UNKNOWN),
        PROTO_MQTT => infer_mqtt(sample, count, ctx).unwrap_or(MESSAGE_UNKNOWN),
        _ => MESSAGE_UNKNOWN,
    };

    if m.msg_type == MSG_REQUEST || m.msg_type == MSG_RESPONSE {
        ctx.settle_role(m.msg_type);
    }
    m
}

fn infer_fresh(sample: &[u8], count: usize, ctx: &mut InferCtx) -> ProtocolMessage {
    if let Some(m) = infer_http1(sample, count) {
        return m;
    }
    if let Some(m) = infer_http2(sample, count, ctx) {
        return m;
    }
    if let Some(m) = infer_dns(sample, count, ctx) {
        return m;
    }
    if let Some(m) = infer_dubbo(sample, count) {
        return m;
    }
    if let Some(m) = infer_kafka(sample, count, ctx) {
        return m;
    }
    if let Some(m) = infer_mysql(sample, count, ctx) {
        return m;
    }
    if let Some(m) = infer_redis(sample, count, ctx) {
        return m;
    }
    if let Some(m) = infer_mqtt(sample, count, ctx) {
        return m;
    }

    // A bare 4-byte read on an unclassified TCP session is the MySQL /
    // Kafka length-prefix pattern: stash it and wait for the body.
    if count == 4 && ctx.l4_protocol == IPPROTO_TCP && sample.len() >= 4 {
        ctx.prev[0] = sample[0];
        ctx.prev[1] = sample[1];
        ctx.prev[2] = sample[2];
        ctx.prev[3] = sample[3];
        ctx.prev_len = 4;
        return ProtocolMessage {
            protocol: PROTO_UNKNOWN,
            msg_type: MSG_PRESTORE,
        };
    }

    MESSAGE_UNKNOWN
}

// ---------------------------------------------------------------------------
// HTTP/1
// ---------------------------------------------------------------------------

#[inline]
fn starts_with(sample: &[u8], prefix: &[u8]) -> bool {
    if sample.len() < prefix.len() {
        return false;
    }
    let mut i = 0;
    while i < prefix.len() {
        if sample[i] != prefix[i] {
            return false;
        }
        i += 1;
    }
    true
}

fn infer_http1(sample: &[u8], count: usize) -> Option<ProtocolMessage> {
    if count < 8 {
        return None;
    }
    if starts_with(sample, b"HTTP/1.") {
        return Some(ProtocolMessage {
            protocol: PROTO_HTTP1,
            msg_type: MSG_RESPONSE,
        });
    }
    let is_request = starts_with(sample, b"GET ")
        || starts_with(sample, b"POST ")
        || starts_with(sample, b"PUT ")
        || starts_with(sample, b"DELETE ")
        || starts_with(sample, b"HEAD ")
        || starts_with(sample, b"OPTIONS ")
        || starts_with(sample, b"PATCH ");
    if is_request {
        return Some(ProtocolMessage {
            protocol: PROTO_HTTP1,
            msg_type: MSG_REQUEST,
        });
    }
    None
}

// ---------------------------------------------------------------------------
// HTTP/2
// ---------------------------------------------------------------------------

fn infer_http2(sample: &[u8], count: usize, ctx: &InferCtx) -> Option<ProtocolMessage> {
    if starts_with(sample, b"PRI * HTTP/2") {
        return Some(ProtocolMessage {
            protocol: PROTO_HTTP2,
            msg_type: MSG_REQUEST,
        });
    }
    // Frame-header recognition only once the session is known to speak
    // h2; a 9-byte frame header alone is too weak a signal.
    if ctx.existing_l7 != PROTO_HTTP2 || count < 9 || sample.len() < 9 {
        return None;
    }
    let frame_len = be24(sample);
    let frame_type = sample[3];
    if frame_len > 16384 || frame_type > 0x9 {
        return None;
    }
    let msg_type = ctx.msg_by_role();
    if msg_type == MSG_UNKNOWN {
        return None;
    }
    Some(ProtocolMessage {
        protocol: PROTO_HTTP2,
        msg_type,
    })
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

fn infer_dns(sample: &[u8], count: usize, ctx: &InferCtx) -> Option<ProtocolMessage> {
    // TCP DNS carries a 2-byte length prefix; only trust it on port 53.
    let (hdr, hdr_count) = match ctx.l4_protocol {
        IPPROTO_UDP => (sample, count),
        IPPROTO_TCP if ctx.dport == 53 || ctx.sport == 53 => {
            if sample.len() < 14 {
                return None;
            }
            (&sample[2..], count.saturating_sub(2))
        }
        _ => return None,
    };

    if hdr_count < 12 || hdr.len() < 12 {
        return None;
    }

    let flags1 = hdr[2];
    let flags2 = hdr[3];
    let qr = flags1 >> 7;
    let opcode = (flags1 >> 3) & 0x0f;
    let zero_bit = (flags2 >> 6) & 1;
    let qdcount = u16::from_be_bytes([hdr[4], hdr[5]]);
    let ancount = u16::from_be_bytes([hdr[6], hdr[7]]);
    let nscount = u16::from_be_bytes([hdr[8], hdr[9]]);

    if opcode != 0 || zero_bit != 0 {
        return None;
    }
    if !(1..=4).contains(&qdcount) {
        return None;
    }

    if qr == 0 {
        if ancount != 0 || nscount != 0 {
            return None;
        }
        Some(ProtocolMessage {
            protocol: PROTO_DNS,
            msg_type: MSG_REQUEST,
        })
    } else {
        Some(ProtocolMessage {
            protocol: PROTO_DNS,
            msg_type: MSG_RESPONSE,
        })
    }
}

// ---------------------------------------------------------------------------
// MySQL — 3-byte little-endian length + 1-byte packet number
// ---------------------------------------------------------------------------

#[inline]
fn le24(b: &[u8]) -> u32 {
    b[0] as u32 | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
}

#[inline]
fn be24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

#[inline]
fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// COM_* command range accepted in the first request byte.
#[inline]
fn mysql_command_valid(cmd: u8) -> bool {
    (0x01..=0x1f).contains(&cmd)
}

fn infer_mysql(sample: &[u8], count: usize, ctx: &mut InferCtx) -> Option<ProtocolMessage> {
    if ctx.l4_protocol != IPPROTO_TCP {
        return None;
    }
    // Header-only read on an already-classified MySQL session: stash.
    if count == 4 && ctx.existing_l7 == PROTO_MYSQL && sample.len() >= 4 {
        ctx.prev[0] = sample[0];
        ctx.prev[1] = sample[1];
        ctx.prev[2] = sample[2];
        ctx.prev[3] = sample[3];
        ctx.prev_len = 4;
        return Some(ProtocolMessage {
            protocol: PROTO_MYSQL,
            msg_type: MSG_PRESTORE,
        });
    }
    if count < 5 || sample.len() < 5 {
        return None;
    }
    let pkt_len = le24(sample) as usize;
    let pkt_num = sample[3];
    if pkt_len == 0 || pkt_len + 4 != count {
        // A classified session whose framing stopped matching is stale.
        if ctx.existing_l7 == PROTO_MYSQL {
            return Some(ProtocolMessage {
                protocol: PROTO_MYSQL,
                msg_type: MSG_CLEAR,
            });
        }
        return None;
    }
    match pkt_num {
        0 if mysql_command_valid(sample[4]) => Some(ProtocolMessage {
            protocol: PROTO_MYSQL,
            msg_type: MSG_REQUEST,
        }),
        1 => Some(ProtocolMessage {
            protocol: PROTO_MYSQL,
            msg_type: MSG_RESPONSE,
        }),
        _ => None,
    }
}

/// The stashed 4 bytes are the packet header; this payload is the body.
fn infer_mysql_with_prev(sample: &[u8], count: usize, ctx: &mut InferCtx) -> Option<ProtocolMessage> {
    let pkt_len = le24(&ctx.prev) as usize;
    let pkt_num = ctx.prev[3];
    if pkt_len == 0 || pkt_len != count {
        return None;
    }
    match pkt_num {
        0 if !sample.is_empty() && mysql_command_valid(sample[0]) => Some(ProtocolMessage {
            protocol: PROTO_MYSQL,
            msg_type: MSG_REQUEST,
        }),
        1 => Some(ProtocolMessage {
            protocol: PROTO_MYSQL,
            msg_type: MSG_RESPONSE,
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Kafka — 4-byte big-endian length, then api_key/api_version/correlation_id
// ---------------------------------------------------------------------------

const KAFKA_API_KEY_MAX: i16 = 67;
const KAFKA_API_VERSION_MAX: i16 = 24;

/// Correlation id of a well-formed request header
/// (api_key | api_version | correlation_id), or None.
fn kafka_request_correlation(body: &[u8], body_count: usize) -> Option<i32> {
    if body_count < 8 || body.len() < 8 {
        return None;
    }
    let api_key = i16::from_be_bytes([body[0], body[1]]);
    let api_version = i16::from_be_bytes([body[2], body[3]]);
    let correlation_id = be32(&body[4..8]) as i32;
    if !(0..=KAFKA_API_KEY_MAX).contains(&api_key)
        || !(0..=KAFKA_API_VERSION_MAX).contains(&api_version)
        || correlation_id < 0
    {
        return None;
    }
    Some(correlation_id)
}

/// Kafka classification is two-step: a request header alone is too weak
/// a signal, so the first request is withheld (RECONFIRM) and the session
/// only settles when a response echoes the stored correlation id.
fn kafka_classify(sample: &[u8], count: usize, ctx: &mut InferCtx) -> Option<ProtocolMessage> {
    if ctx.need_reconfirm && ctx.correlation_id >= 0 && sample.len() >= 4 {
        let corr = be32(sample) as i32;
        if corr == ctx.correlation_id {
            ctx.need_reconfirm = false;
            return Some(ProtocolMessage {
                protocol: PROTO_KAFKA,
                msg_type: MSG_RESPONSE,
            });
        }
    }

    if let Some(corr) = kafka_request_correlation(sample, count) {
        ctx.correlation_id = corr;
        if ctx.existing_l7 == PROTO_KAFKA && !ctx.need_reconfirm {
            return Some(ProtocolMessage {
                protocol: PROTO_KAFKA,
                msg_type: MSG_REQUEST,
            });
        }
        ctx.need_reconfirm = true;
        return Some(ProtocolMessage {
            protocol: PROTO_KAFKA,
            msg_type: MSG_RECONFIRM,
        });
    }

    if ctx.existing_l7 == PROTO_KAFKA {
        if ctx.need_reconfirm {
            // Neither the awaited response nor another request: the
            // session contradicts its tentative classification.
            return Some(ProtocolMessage {
                protocol: PROTO_KAFKA,
                msg_type: MSG_CLEAR,
            });
        }
        // A settled session's non-request payload is a response.
        if sample.len() >= 4 && be32(sample) as i32 >= 0 {
            return Some(ProtocolMessage {
                protocol: PROTO_KAFKA,
                msg_type: MSG_RESPONSE,
            });
        }
    }
    None
}

fn infer_kafka(sample: &[u8], count: usize, ctx: &mut InferCtx) -> Option<ProtocolMessage> {
    if ctx.l4_protocol != IPPROTO_TCP {
        return None;
    }
    if count == 4 && ctx.existing_l7 == PROTO_KAFKA && sample.len() >= 4 {
        ctx.prev[0] = sample[0];
        ctx.prev[1] = sample[1];
        ctx.prev[2] = sample[2];
        ctx.prev[3] = sample[3];
        ctx.prev_len = 4;
        return Some(ProtocolMessage {
            protocol: PROTO_KAFKA,
            msg_type: MSG_PRESTORE,
        });
    }
    if count < 12 || sample.len() < 12 {
        return None;
    }
    let msg_len = be32(sample) as usize;
    if msg_len == 0 || msg_len + 4 != count {
        return None;
    }
    kafka_classify(&sample[4..], count - 4, ctx)
}

fn infer_kafka_with_prev(sample: &[u8], count: usize, ctx: &mut InferCtx) -> Option<ProtocolMessage> {
    let msg_len = be32(&ctx.prev) as usize;
    if msg_len == 0 || msg_len != count {
        return None;
    }
    kafka_classify(sample, count, ctx)
}

// ---------------------------------------------------------------------------
// Redis — RESP type markers
// ---------------------------------------------------------------------------

fn infer_redis(sample: &[u8], count: usize, ctx: &InferCtx) -> Option<ProtocolMessage> {
    if ctx.l4_protocol != IPPROTO_TCP || count < 4 || sample.len() < 2 {
        return None;
    }
    match sample[0] {
        b'*' => {
            if !sample[1].is_ascii_digit() {
                return None;
            }
            // Arrays are used in both directions; a settled role decides,
            // otherwise the multi-bulk form defaults to a request.
            let by_role = ctx.msg_by_role();
            let msg_type = if by_role == MSG_UNKNOWN {
                MSG_REQUEST
            } else {
                by_role
            };
            Some(ProtocolMessage {
                protocol: PROTO_REDIS,
                msg_type,
            })
        }
        b'+' | b'-' | b':' | b'$' => Some(ProtocolMessage {
            protocol: PROTO_REDIS,
            msg_type: MSG_RESPONSE,
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Dubbo — 0xdabb magic, flag bit 0x80 marks requests
// ---------------------------------------------------------------------------

fn infer_dubbo(sample: &[u8], count: usize) -> Option<ProtocolMessage> {
    if count < 16 || sample.len() < 3 {
        return None;
    }
    if sample[0] != 0xda || sample[1] != 0xbb {
        return None;
    }
    let msg_type = if sample[2] & 0x80 != 0 {
        MSG_REQUEST
    } else {
        MSG_RESPONSE
    };
    Some(ProtocolMessage {
        protocol: PROTO_DUBBO,
        msg_type,
    })
}

// ---------------------------------------------------------------------------
// MQTT — fixed header: packet type nibble + remaining-length varint
// ---------------------------------------------------------------------------

fn infer_mqtt(sample: &[u8], count: usize, ctx: &InferCtx) -> Option<ProtocolMessage> {
    if ctx.l4_protocol != IPPROTO_TCP || count < 2 || sample.len() < 2 {
        return None;
    }
    let packet_type = sample[0] >> 4;
    let remaining = sample[1];
    // Single-byte remaining length must account for the exact payload;
    // multi-byte (bit 7 set) lengths are not length-checked here.
    if remaining < 0x80 && count != 2 + remaining as usize {
        return None;
    }

    let msg_type = match packet_type {
        // CONNECT carries the protocol name "MQTT" right after the
        // 2-byte name length.
        1 => {
            if sample.len() >= 8 && !(starts_with(&sample[4..], b"MQTT")) {
                return None;
            }
            MSG_REQUEST
        }
        2 | 9 | 11 | 13 => MSG_RESPONSE,
        8 | 10 | 12 | 14 => MSG_REQUEST,
        4 | 5 | 7 => MSG_RESPONSE,
        6 => MSG_REQUEST,
        // PUBLISH flows both ways; only a settled role can orient it.
        3 => {
            let by_role = ctx.msg_by_role();
            if by_role == MSG_UNKNOWN {
                return None;
            }
            by_role
        }
        _ => return None,
    };

    Some(ProtocolMessage {
        protocol: PROTO_MQTT,
        msg_type,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_ctx(direction: u8) -> InferCtx {
        InferCtx {
            direction,
            l4_protocol: IPPROTO_TCP,
            dport: 0,
            sport: 0,
            existing_l7: PROTO_UNKNOWN,
            role: ROLE_UNKNOWN,
            need_reconfirm: false,
            correlation_id: -1,
            prev: [0; 4],
            prev_len: 0,
        }
    }

    fn udp_ctx(direction: u8) -> InferCtx {
        InferCtx {
            l4_protocol: IPPROTO_UDP,
            ..tcp_ctx(direction)
        }
    }

    #[test]
    fn http1_request_and_response() {
        let req = b"GET /x HTTP/1.1\r\nHost: y\r\n\r\n";
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(req, req.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_HTTP1);
        assert_eq!(m.msg_type, MSG_REQUEST);
        assert_eq!(ctx.role, ROLE_CLIENT);

        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut ctx = tcp_ctx(T_INGRESS);
        ctx.existing_l7 = PROTO_HTTP1;
        let m = infer_protocol(resp, resp.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_HTTP1);
        assert_eq!(m.msg_type, MSG_RESPONSE);
    }

    #[test]
    fn http1_rejects_short_payload() {
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(b"GET /", 5, &mut ctx);
        assert_eq!(m.protocol, PROTO_UNKNOWN);
    }

    #[test]
    fn dns_udp_query_response_pair() {
        // id=0x1234, flags=0x0100 (RD), qd=1
        let query = [
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'f',
            b'o', b'o', 0x00, 0x00, 0x01, 0x00, 0x01,
        ];
        let mut ctx = udp_ctx(T_EGRESS);
        let m = infer_protocol(&query, query.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_DNS);
        assert_eq!(m.msg_type, MSG_REQUEST);

        // flags=0x8180 (QR|RD|RA), qd=1, an=1
        let resp = [
            0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, b'f',
            b'o', b'o', 0x00, 0x00, 0x01, 0x00, 0x01,
        ];
        let mut ctx = udp_ctx(T_INGRESS);
        ctx.existing_l7 = PROTO_DNS;
        let m = infer_protocol(&resp, resp.len(), &mut ctx);
        assert_eq!(m.msg_type, MSG_RESPONSE);
    }

    #[test]
    fn dns_rejects_nonzero_opcode() {
        let mut pkt = [0u8; 21];
        pkt[2] = 0x28; // opcode 5
        pkt[5] = 1;
        let mut ctx = udp_ctx(T_EGRESS);
        assert_eq!(infer_protocol(&pkt, pkt.len(), &mut ctx), MESSAGE_UNKNOWN);
    }

    #[test]
    fn mysql_prestore_then_body() {
        // First read: bare 4-byte header, len=5, packet number 0.
        let header = [0x05, 0x00, 0x00, 0x00];
        let mut ctx = tcp_ctx(T_INGRESS);
        let m = infer_protocol(&header, 4, &mut ctx);
        assert_eq!(m.msg_type, MSG_PRESTORE);
        assert_eq!(ctx.prev_len, 4);
        assert_eq!(ctx.prev, header);

        // Second read: 5-byte body starting with COM_QUERY (0x03).
        let body = [0x03, b's', b'e', b'l', b'1'];
        let m = infer_protocol(&body, body.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_MYSQL);
        assert_eq!(m.msg_type, MSG_REQUEST);
    }

    #[test]
    fn mysql_single_read() {
        // len=5, packet 0, COM_QUERY + "q" * 4
        let pkt = [0x05, 0x00, 0x00, 0x00, 0x03, b'q', b'q', b'q', b'q'];
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(&pkt, pkt.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_MYSQL);
        assert_eq!(m.msg_type, MSG_REQUEST);
    }

    #[test]
    fn kafka_reconfirm_settles_on_correlated_response() {
        // len=12 | api_key=18 (ApiVersions) | api_version=2 | corr=7 | rest
        let mut req = [0u8; 16];
        req[..4].copy_from_slice(&12u32.to_be_bytes());
        req[4..6].copy_from_slice(&18i16.to_be_bytes());
        req[6..8].copy_from_slice(&2i16.to_be_bytes());
        req[8..12].copy_from_slice(&7u32.to_be_bytes());
        let mut ctx = tcp_ctx(T_EGRESS);
        // The first request is withheld pending confirmation.
        let m = infer_protocol(&req, req.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_KAFKA);
        assert_eq!(m.msg_type, MSG_RECONFIRM);
        assert_eq!(ctx.correlation_id, 7);
        assert!(ctx.need_reconfirm);

        let mut resp = [0u8; 16];
        resp[..4].copy_from_slice(&12u32.to_be_bytes());
        resp[4..8].copy_from_slice(&7u32.to_be_bytes());
        ctx.direction = T_INGRESS;
        ctx.existing_l7 = PROTO_KAFKA;
        let m = infer_protocol(&resp, resp.len(), &mut ctx);
        assert_eq!(m.msg_type, MSG_RESPONSE);
        assert!(!ctx.need_reconfirm);

        // Settled session: later requests emit directly.
        let mut req2 = req;
        req2[8..12].copy_from_slice(&8u32.to_be_bytes());
        ctx.direction = T_EGRESS;
        let m = infer_protocol(&req2, req2.len(), &mut ctx);
        assert_eq!(m.msg_type, MSG_REQUEST);
        assert_eq!(ctx.correlation_id, 8);
        assert!(!ctx.need_reconfirm);
    }

    #[test]
    fn redis_markers() {
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(b"*1\r\n$4\r\nPING\r\n", 14, &mut ctx);
        assert_eq!(m.protocol, PROTO_REDIS);
        assert_eq!(m.msg_type, MSG_REQUEST);

        let mut ctx = tcp_ctx(T_INGRESS);
        let m = infer_protocol(b"+PONG\r\n", 7, &mut ctx);
        assert_eq!(m.msg_type, MSG_RESPONSE);
    }

    #[test]
    fn dubbo_magic() {
        let mut pkt = [0u8; 20];
        pkt[0] = 0xda;
        pkt[1] = 0xbb;
        pkt[2] = 0xc2; // request + two-way
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(&pkt, pkt.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_DUBBO);
        assert_eq!(m.msg_type, MSG_REQUEST);

        pkt[2] = 0x42; // response
        let mut ctx = tcp_ctx(T_INGRESS);
        let m = infer_protocol(&pkt, pkt.len(), &mut ctx);
        assert_eq!(m.msg_type, MSG_RESPONSE);
    }

    #[test]
    fn mqtt_connect() {
        // CONNECT, remaining=12, name len 4, "MQTT"
        let pkt = [
            0x10, 0x0c, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c, 0x00, 0x00,
        ];
        let mut ctx = tcp_ctx(T_EGRESS);
        let m = infer_protocol(&pkt, pkt.len(), &mut ctx);
        assert_eq!(m.protocol, PROTO_MQTT);
        assert_eq!(m.msg_type, MSG_REQUEST);
    }

    #[test]
    fn prestore_only_on_tcp() {
        let header = [0x05, 0x00, 0x00, 0x00];
        let mut ctx = udp_ctx(T_INGRESS);
        let m = infer_protocol(&header, 4, &mut ctx);
        assert_eq!(m, MESSAGE_UNKNOWN);
        assert_eq!(ctx.prev_len, 0);
    }

    #[test]
    fn classified_session_skips_other_recognizers() {
        // Redis marker on a session classified as HTTP/1 stays unknown.
        let mut ctx = tcp_ctx(T_EGRESS);
        ctx.existing_l7 = PROTO_HTTP1;
        let m = infer_protocol(b"+OK\r\n....", 9, &mut ctx);
        assert_eq!(m, MESSAGE_UNKNOWN);
    }
}
