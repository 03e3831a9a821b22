//! Control request delivery integration tests
//!
//! Batching and key substitution over HTTP, answer routing over WebSocket,
//! and retransmission of unanswered requests.

mod common;

use common::{test_env, CountingTutor, Harness};
use std::sync::Arc;
use tlcp_client::batch::{BatchKind, BatchRequest, RequestObjects};
use tlcp_client::listener::{ControlKind, ControlOutcome};
use tlcp_client::protocol::ProtocolEvent;
use tlcp_client::request_manager::{ManagerEvent, RequestManager};
use tlcp_client::scheduler::TimerKind;
use tlcp_client::transport::{TransportEvent, TransportEventKind};
use tlcp_client::tutor::RequestTutor;
use tlcp_client::ws_manager::WsRequestManager;
use tlcp_client::{ClientEvent, ConnectionOptions};
use tlcp_core::{
    ClientRequest, ForcedTransport, Frequency, StreamParams, SubscriptionMode, SubscriptionParams,
    Transport,
};

fn http_streaming() -> ConnectionOptions {
    ConnectionOptions {
        forced_transport: Some(ForcedTransport::Exact(Transport::HttpStreaming)),
        ..ConnectionOptions::default()
    }
}

fn params() -> SubscriptionParams {
    SubscriptionParams::new(SubscriptionMode::Merge, "item1 item2", "last_price")
}

fn req_id_of(body: &str) -> String {
    body.split('&')
        .find_map(|pair| pair.strip_prefix("LS_reqId="))
        .expect("request without LS_reqId")
        .to_string()
}

#[test]
fn test_unsubscribe_replaces_queued_subscribe() {
    let subscribe_tutor = CountingTutor::shared();
    let unsubscribe_tutor = CountingTutor::shared();
    let mut queue = BatchRequest::new(BatchKind::Control);

    assert!(queue.add(RequestObjects::new(
        ClientRequest::Subscribe {
            req_id: 1,
            sub_id: 5,
            params: params(),
        },
        subscribe_tutor.clone(),
    )));
    assert!(queue.add(RequestObjects::new(
        ClientRequest::Unsubscribe { req_id: 2, sub_id: 5 },
        unsubscribe_tutor.clone(),
    )));

    assert_eq!(queue.len(), 1);
    assert!(matches!(
        queue.first().map(|objects| &objects.request),
        Some(ClientRequest::Unsubscribe { sub_id: 5, .. })
    ));
    assert_eq!(subscribe_tutor.aborts(), 1);
    assert_eq!(unsubscribe_tutor.aborts(), 0);
}

#[test]
fn test_queued_requests_batched_after_substitution() {
    let mut h = Harness::new(http_streaming());
    h.receiving_over_http("S1");
    let mut out = Vec::new();

    h.manager.subscribe(&mut h.env, 1, params(), &mut out);
    let (first, request) = h.wire.last_http();
    assert!(request.url.contains("control.txt"));
    assert!(request.body.contains("LS_op=add"));
    let sent = h.wire.http_requests().len();

    h.manager.subscribe(&mut h.env, 5, params(), &mut out);
    h.manager.unsubscribe(&mut h.env, 5, &mut out);
    h.manager
        .reconfigure(&mut h.env, 1, Frequency::Limited(2.0), &mut out);
    h.manager
        .reconfigure(&mut h.env, 1, Frequency::Limited(5.0), &mut out);
    assert_eq!(h.wire.http_requests().len(), sent);

    let reqok = format!("REQOK,{}", req_id_of(&request.body));
    h.feed(first, &[reqok.as_str()]);
    h.transport(first, TransportEventKind::Closed);

    let (_, batch) = h.wire.last_http();
    let lines: Vec<&str> = batch.body.split("\r\n").collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("LS_op=delete") && lines[0].contains("LS_subId=5"));
    assert!(lines[1].contains("LS_op=reconf"));
    assert!(lines[1].contains("LS_requested_max_frequency=5"));
    assert!(!batch.body.contains("LS_op=add"));
}

#[test]
fn test_refused_subscription_reported() {
    let mut h = Harness::new(http_streaming());
    h.receiving_over_http("S1");
    let mut out = Vec::new();
    h.manager.subscribe(&mut h.env, 4, params(), &mut out);
    let (conn, request) = h.wire.last_http();

    h.take_events();
    let reqerr = format!("REQERR,{},17,bad data adapter", req_id_of(&request.body));
    h.feed(conn, &[reqerr.as_str()]);
    h.transport(conn, TransportEventKind::Closed);
    assert_eq!(
        h.take_events(),
        vec![ClientEvent::SubscriptionError {
            sub_id: 4,
            code: 17,
            message: "bad data adapter".into(),
        }]
    );
}

#[test]
fn test_unanswered_request_retransmitted() {
    let mut h = Harness::new(http_streaming());
    h.receiving_over_http("S1");
    let mut out = Vec::new();
    h.manager.unsubscribe(&mut h.env, 2, &mut out);
    let (conn, request) = h.wire.last_http();

    // Closed with an empty body is not an answer
    h.transport(conn, TransportEventKind::Closed);
    assert!(h.fire(|kind| matches!(kind, TimerKind::Retransmit { .. })));
    let (again, retransmitted) = h.wire.last_http();
    assert_ne!(again, conn);
    assert_eq!(retransmitted.body, request.body);

    let reqok = format!("REQOK,{}", req_id_of(&request.body));
    h.feed(again, &[reqok.as_str()]);
    h.transport(again, TransportEventKind::Closed);
    let sent = h.wire.http_requests().len();
    assert!(h.fire(|kind| matches!(kind, TimerKind::Retransmit { .. })));
    assert_eq!(h.wire.http_requests().len(), sent);
}

#[test]
fn test_ws_answer_routed_once() {
    let (mut env, wire) = test_env(ConnectionOptions::default());
    let mut manager = WsRequestManager::new("ws://push.example.com/lightstreamer");
    manager.set_session("S1");
    let mut events = Vec::new();

    let bind = RequestObjects::new(
        ClientRequest::BindSession {
            session_id: "S1".into(),
            stream: StreamParams::immediate_poll(),
        },
        CountingTutor::shared(),
    );
    assert!(manager.send_bind(&mut env, bind));
    let conn = manager.conn().unwrap();
    for kind in [
        TransportEventKind::Open,
        TransportEventKind::Written,
        TransportEventKind::Written,
    ] {
        manager.on_transport(&mut env, &TransportEvent::new(conn, kind), &mut events);
    }

    let tutor = CountingTutor::shared();
    manager.add(
        &mut env,
        RequestObjects::new(ClientRequest::Unsubscribe { req_id: 7, sub_id: 3 }, tutor.clone()),
        &mut events,
    );
    manager.on_transport(
        &mut env,
        &TransportEvent::new(conn, TransportEventKind::Written),
        &mut events,
    );
    assert_eq!(tutor.sent(), 1);
    assert_eq!(manager.pending_count(), 1);
    assert_eq!(wire.ws_frames()[0].1, "wsok");
    assert!(wire.ws_frames()[2].1.starts_with("control\r\n"));

    let mut answers = Vec::new();
    manager.on_req_ok(7, &mut answers);
    manager.on_req_ok(7, &mut answers);
    manager.on_req_err(7, 19, "late".into(), &mut answers);

    assert_eq!(answers.len(), 1);
    assert!(matches!(
        &answers[0],
        ManagerEvent::Response(ProtocolEvent::ControlResponse {
            kind: ControlKind::Unsubscribe { sub_id: 3 },
            outcome: ControlOutcome::Ok,
        })
    ));
    assert!(tutor.verify_success());
    assert_eq!(manager.pending_count(), 0);
}

#[test]
fn test_ws_unsent_requests_move_to_http() {
    let (mut env, _wire) = test_env(ConnectionOptions::default());
    let mut manager = WsRequestManager::new("ws://push.example.com/lightstreamer");
    let mut events = Vec::new();
    let tutors: Vec<Arc<CountingTutor>> = (0..2).map(|_| CountingTutor::shared()).collect();
    for (req_id, tutor) in tutors.iter().enumerate() {
        manager.add(
            &mut env,
            RequestObjects::new(
                ClientRequest::Unsubscribe {
                    req_id: req_id as u64 + 1,
                    sub_id: req_id as u32 + 1,
                },
                tutor.clone(),
            ),
            &mut events,
        );
    }

    let unsent = manager.take_unsent();
    assert_eq!(unsent.len(), 2);
    assert!(tutors.iter().all(|tutor| tutor.sent() == 0 && tutor.aborts() == 0));
}
