//! Session recovery integration tests
//!
//! Interrupted streams resume from the last delivered prog while the
//! recovery budget lasts, and fall back to a fresh session once it runs out.

mod common;

use common::Harness;
use std::time::Duration;
use tlcp_client::scheduler::PhaseTimer;
use tlcp_client::transport::TransportEventKind;
use tlcp_client::{ClientEvent, ConnectionOptions};
use tlcp_core::{ClientStatus, FieldValue, ForcedTransport, Transport};

fn http_streaming() -> ConnectionOptions {
    ConnectionOptions {
        forced_transport: Some(ForcedTransport::Exact(Transport::HttpStreaming)),
        session_recovery_timeout_ms: 15_000,
        ..ConnectionOptions::default()
    }
}

/// Break the stream and let the first recovery go out
fn interrupt(h: &mut Harness, stream: u64) {
    h.transport(stream, TransportEventKind::Closed);
    assert_eq!(h.status(), ClientStatus::TryingRecovery);
    // The first pause is jittered and may be zero
    h.fire_phase(PhaseTimer::Sleep);
}

#[test]
fn test_recovery_resumes_from_last_prog() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");
    h.feed(bind, &["U,1,1,a", "U,1,1,b"]);

    interrupt(&mut h, bind);
    let (recovery, request) = h.wire.last_http();
    assert!(request.url.contains("bind_session.txt"));
    assert!(request.body.contains("LS_session=S1"));
    assert!(request.body.contains("LS_recovery_from=2"));
    assert!(request.body.contains("LS_polling=true"));

    h.take_events();
    h.feed(
        recovery,
        &["CONOK,S1,50000000,5000,*", "PROG,1", "U,1,1,b", "U,1,1,c"],
    );
    let events = h.take_events();
    assert!(events.contains(&ClientEvent::SessionStarted {
        session_id: "S1".into(),
        recovered: true,
    }));
    let updates: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Update { fields, .. } => Some(fields.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![vec![FieldValue::Value("c".into())]]);
}

#[test]
fn test_recovered_session_binds_again() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");
    interrupt(&mut h, bind);
    let recovery = h.last_http_conn();

    h.feed(recovery, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
    let (rebind, request) = h.wire.last_http();
    assert_ne!(rebind, recovery);
    assert!(request.body.contains("LS_session=S1"));
    assert!(!request.body.contains("LS_recovery_from"));

    h.feed(rebind, &["CONOK,S1,50000000,5000,*"]);
    assert_eq!(h.status(), ClientStatus::Connected(Transport::HttpStreaming));
}

#[test]
fn test_recovery_budget_exhausted_starts_fresh_session() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");
    interrupt(&mut h, bind);
    let recovery = h.last_http_conn();

    h.wire.advance(Duration::from_millis(20_000));
    h.transport(recovery, TransportEventKind::Broken("connection reset".into()));
    assert_eq!(h.status(), ClientStatus::WillRetry);

    assert!(h.fire_phase(PhaseTimer::Sleep));
    let (_, create) = h.wire.last_http();
    assert!(create.url.contains("create_session.txt"));
    assert_eq!(h.status(), ClientStatus::Connecting);
}

#[test]
fn test_prog_mismatch_prevents_recovery() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");
    h.feed(bind, &["U,1,1,a", "PROG,7"]);

    h.transport(bind, TransportEventKind::Closed);
    assert_eq!(h.status(), ClientStatus::WillRetry);
    assert!(h.fire_phase(PhaseTimer::Sleep));
    let (_, create) = h.wire.last_http();
    assert!(create.url.contains("create_session.txt"));
}

#[test]
fn test_takeover_creates_new_session_at_once() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");
    let sent = h.wire.http_requests().len();

    h.feed(bind, &["END,41,session taken over"]);
    let requests = h.wire.http_requests();
    assert_eq!(requests.len(), sent + 1);
    assert!(requests[sent].1.url.contains("create_session.txt"));
    assert_eq!(h.status(), ClientStatus::Connecting);
}

#[test]
fn test_stalled_stream_recovers() {
    let mut h = Harness::new(http_streaming());
    let bind = h.receiving_over_http("S1");

    assert!(h.fire_phase(PhaseTimer::Keepalive));
    assert!(h.fire_phase(PhaseTimer::Keepalive));
    assert_eq!(h.status(), ClientStatus::Stalled);

    h.feed(bind, &["PROBE"]);
    assert_eq!(h.status(), ClientStatus::Connected(Transport::HttpStreaming));

    assert!(h.fire_phase(PhaseTimer::Keepalive));
    assert!(h.fire_phase(PhaseTimer::Keepalive));
    assert!(h.fire_phase(PhaseTimer::Keepalive));
    assert_eq!(h.status(), ClientStatus::TryingRecovery);
}
