//! Protocol-inference scenario tests.
//!
//! Drives the shared classifier through multi-payload session histories
//! the way the kernel handlers would: the caller carries the session
//! state (`InferCtx`) across events and applies the control outcomes
//! (prestore stash, reconfirm, clear) exactly as the submit path does.

use socktrace::common::inference::{infer_protocol, InferCtx, ProtocolMessage};
use socktrace::common::{
    IPPROTO_TCP, IPPROTO_UDP, MSG_PRESTORE, MSG_RECONFIRM, MSG_REQUEST, MSG_RESPONSE, MSG_UNKNOWN,
    PROTO_DNS, PROTO_HTTP1, PROTO_KAFKA, PROTO_MYSQL, PROTO_REDIS, PROTO_UNKNOWN, ROLE_CLIENT,
    ROLE_SERVER, ROLE_UNKNOWN, T_EGRESS, T_INGRESS,
};

/// A session as the kernel sees it: inference state carried between
/// events, updated from each outcome.
struct Session {
    l7: u16,
    role: u8,
    need_reconfirm: bool,
    correlation_id: i32,
    prev: [u8; 4],
    prev_len: u32,
    l4: u8,
}

impl Session {
    fn tcp() -> Self {
        Session {
            l7: PROTO_UNKNOWN,
            role: ROLE_UNKNOWN,
            need_reconfirm: false,
            correlation_id: -1,
            prev: [0; 4],
            prev_len: 0,
            l4: IPPROTO_TCP,
        }
    }

    fn udp() -> Self {
        Session {
            l4: IPPROTO_UDP,
            ..Session::tcp()
        }
    }

    fn event(&mut self, direction: u8, payload: &[u8]) -> ProtocolMessage {
        let sample_len = payload.len().min(32);
        let mut ctx = InferCtx {
            direction,
            l4_protocol: self.l4,
            dport: 0,
            sport: 0,
            existing_l7: self.l7,
            role: self.role,
            need_reconfirm: self.need_reconfirm,
            correlation_id: self.correlation_id,
            prev: self.prev,
            prev_len: self.prev_len,
        };
        let m = infer_protocol(&payload[..sample_len], payload.len(), &mut ctx);

        self.role = ctx.role;
        self.need_reconfirm = ctx.need_reconfirm;
        self.correlation_id = ctx.correlation_id;
        self.prev = ctx.prev;
        self.prev_len = ctx.prev_len;
        if m.protocol != PROTO_UNKNOWN && m.msg_type != MSG_PRESTORE {
            self.l7 = m.protocol;
        }
        m
    }
}

// ---------------------------------------------------------------------------
// S1-style: HTTP/1 client GET then response on one socket
// ---------------------------------------------------------------------------

#[test]
fn http_client_get_classifies_both_directions() {
    let mut session = Session::tcp();

    let req = session.event(T_EGRESS, b"GET /x HTTP/1.1\r\nHost: y\r\n\r\n");
    assert_eq!(req.protocol, PROTO_HTTP1);
    assert_eq!(req.msg_type, MSG_REQUEST);
    assert_eq!(session.role, ROLE_CLIENT);

    let resp = session.event(T_INGRESS, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(resp.protocol, PROTO_HTTP1);
    assert_eq!(resp.msg_type, MSG_RESPONSE);
    // The session settled on HTTP/1; later events skip the full chain.
    assert_eq!(session.l7, PROTO_HTTP1);
}

#[test]
fn http_server_side_settles_server_role() {
    let mut session = Session::tcp();
    let req = session.event(T_INGRESS, b"POST /submit HTTP/1.1\r\n\r\n");
    assert_eq!(req.msg_type, MSG_REQUEST);
    assert_eq!(session.role, ROLE_SERVER);

    let resp = session.event(T_EGRESS, b"HTTP/1.1 204 No Content\r\n\r\n");
    assert_eq!(resp.msg_type, MSG_RESPONSE);
}

// ---------------------------------------------------------------------------
// S2-style: DNS query/response over UDP
// ---------------------------------------------------------------------------

fn dns_query() -> Vec<u8> {
    let mut pkt = vec![0x0a, 0x0b, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    pkt.extend_from_slice(&[3, b'w', b'w', b'w', 0, 0, 1, 0, 1]);
    pkt
}

fn dns_response() -> Vec<u8> {
    let mut pkt = vec![0x0a, 0x0b, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0];
    pkt.extend_from_slice(&[3, b'w', b'w', b'w', 0, 0, 1, 0, 1]);
    pkt
}

#[test]
fn dns_udp_pair_classifies() {
    let mut session = Session::udp();

    let q = session.event(T_EGRESS, &dns_query());
    assert_eq!(q.protocol, PROTO_DNS);
    assert_eq!(q.msg_type, MSG_REQUEST);

    let r = session.event(T_INGRESS, &dns_response());
    assert_eq!(r.protocol, PROTO_DNS);
    assert_eq!(r.msg_type, MSG_RESPONSE);
}

// ---------------------------------------------------------------------------
// S3-style: MySQL length-prefix prestore across two reads
// ---------------------------------------------------------------------------

#[test]
fn mysql_split_header_then_body() {
    let mut session = Session::tcp();

    // First read: bare packet header, len=6, packet number 0.
    let m = session.event(T_INGRESS, &[0x06, 0x00, 0x00, 0x00]);
    assert_eq!(m.msg_type, MSG_PRESTORE);
    assert_eq!(session.prev_len, 4);

    // Second read: the 6-byte body (COM_QUERY).
    let m = session.event(T_INGRESS, &[0x03, b's', b'e', b'l', b'e', b'c']);
    assert_eq!(m.protocol, PROTO_MYSQL);
    assert_eq!(m.msg_type, MSG_REQUEST);
    assert_eq!(session.prev_len, 4, "stash stays available for the carry");
}

#[test]
fn stale_prestore_falls_back_to_fresh_inference() {
    let mut session = Session::tcp();
    session.event(T_INGRESS, &[0x99, 0x00, 0x00, 0x00]);
    assert_eq!(session.prev_len, 4);

    // The next payload matches neither stashed framing; the stash is
    // dropped and the payload classifies on its own.
    let m = session.event(T_INGRESS, b"HTTP/1.1 200 OK\r\n");
    assert_eq!(m.protocol, PROTO_HTTP1);
    assert_eq!(session.prev_len, 0);
}

// ---------------------------------------------------------------------------
// Kafka reconfirm flow
// ---------------------------------------------------------------------------

fn kafka_request(correlation: u32) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&16u32.to_be_bytes());
    pkt.extend_from_slice(&3i16.to_be_bytes()); // Metadata
    pkt.extend_from_slice(&5i16.to_be_bytes());
    pkt.extend_from_slice(&correlation.to_be_bytes());
    pkt.extend_from_slice(&[0u8; 8]);
    pkt
}

fn kafka_response(correlation: u32) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&12u32.to_be_bytes());
    pkt.extend_from_slice(&correlation.to_be_bytes());
    pkt.extend_from_slice(&[0u8; 8]);
    pkt
}

#[test]
fn kafka_withholds_first_request_until_response_confirms() {
    let mut session = Session::tcp();

    // The first request only creates tentative state; nothing would be
    // emitted for it.
    let req = session.event(T_EGRESS, &kafka_request(99));
    assert_eq!(req.protocol, PROTO_KAFKA);
    assert_eq!(req.msg_type, MSG_RECONFIRM);
    assert!(session.need_reconfirm);
    assert_eq!(session.correlation_id, 99);

    let resp = session.event(T_INGRESS, &kafka_response(99));
    assert_eq!(resp.msg_type, MSG_RESPONSE);
    assert!(!session.need_reconfirm);

    // Once confirmed, requests emit directly.
    let req2 = session.event(T_EGRESS, &kafka_request(100));
    assert_eq!(req2.msg_type, MSG_REQUEST);
    assert_eq!(session.correlation_id, 100);
}

// ---------------------------------------------------------------------------
// Misc orientation rules
// ---------------------------------------------------------------------------

#[test]
fn redis_role_orients_arrays_after_settling() {
    let mut session = Session::tcp();
    let req = session.event(T_EGRESS, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    assert_eq!(req.protocol, PROTO_REDIS);
    assert_eq!(req.msg_type, MSG_REQUEST);
    assert_eq!(session.role, ROLE_CLIENT);

    // An array arriving on the settled client's ingress is a response.
    let resp = session.event(T_INGRESS, b"*1\r\n$2\r\nok\r\n");
    assert_eq!(resp.msg_type, MSG_RESPONSE);
}

#[test]
fn non_protocol_payload_stays_unknown() {
    let mut session = Session::tcp();
    let m = session.event(T_EGRESS, b"\x00\x01\x02\x03\x04\x05\x06\x07\x08");
    assert_eq!(m.protocol, PROTO_UNKNOWN);
    assert_eq!(m.msg_type, MSG_UNKNOWN);
    assert_eq!(session.role, ROLE_UNKNOWN);
}
