//! Call session state machine tests
//!
//! Exercise the manager directly against a registry of hand-built
//! connections; the relay dispatch layer is covered separately.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use chatwire_server::calls::{CallSessionManager, CallState, SessionError};
use chatwire_server::registry::{Connection, ConnectionRegistry, OUTBOUND_QUEUE};
use chatwire_shared::{Envelope, MediaKind, SignalKind, WebRtcPayload};

fn setup() -> (Arc<ConnectionRegistry>, CallSessionManager) {
    let registry = Arc::new(ConnectionRegistry::new());
    let calls = CallSessionManager::new(registry.clone());
    (registry, calls)
}

fn connect_user(registry: &ConnectionRegistry, user: i64) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    registry.register(user, Connection::new(tx));
    rx
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            out.push(Envelope::decode(&text, 64 * 1024).expect("valid outbound frame"));
        }
    }
    out
}

fn signal(kind: SignalKind, from: i64, to: i64, session_id: &str) -> WebRtcPayload {
    WebRtcPayload {
        kind,
        from,
        to,
        session_id: session_id.to_string(),
        payload: serde_json::json!({"sdp": "v=0"}),
    }
}

fn signal_frame(payload: &WebRtcPayload) -> String {
    Envelope::WebRtcSignal {
        payload: payload.clone(),
    }
    .encode()
    .unwrap()
}

#[test]
fn request_forwards_with_inferred_from() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);

    let sid = uuid::Uuid::new_v4().to_string();
    calls
        .handle_request(1, 2, MediaKind::Audio, sid.clone())
        .unwrap();

    assert_eq!(
        drain(&mut b),
        vec![Envelope::CallRequest {
            contact_id: 2,
            media_type: MediaKind::Audio,
            session_id: sid.clone(),
            from: Some(1),
        }]
    );
    let session = calls.get(&sid).unwrap();
    assert_eq!(session.id, sid);
    assert_eq!(session.state, CallState::Requested);
    assert_eq!((session.initiator, session.target), (1, 2));
}

#[test]
fn request_to_offline_user_creates_no_session() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);

    calls
        .handle_request(1, 2, MediaKind::Video, "s1".to_string())
        .unwrap();

    assert_eq!(
        drain(&mut a),
        vec![Envelope::CallRejected {
            contact_id: 2,
            session_id: "s1".to_string(),
            reason: Some("user offline".to_string()),
            from: None,
        }]
    );
    assert_eq!(calls.active_sessions(), 0);
}

#[test]
fn reusing_a_live_session_id_is_a_violation() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    drain(&mut b);

    let err = calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap_err();
    assert_eq!(err, SessionError::DuplicateSession("s1".to_string()));
    assert!(drain(&mut b).is_empty());
}

#[test]
fn accept_transitions_and_notifies_initiator() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    drain(&mut a);

    calls.handle_accept(2, "s1").unwrap();
    assert_eq!(calls.get("s1").unwrap().state, CallState::Accepted);
    assert_eq!(
        drain(&mut a),
        vec![Envelope::CallAccepted {
            contact_id: 2,
            session_id: "s1".to_string(),
            from: Some(2),
        }]
    );
}

#[test]
fn repeated_accept_is_ignored() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    calls.handle_accept(2, "s1").unwrap();
    drain(&mut a);

    calls.handle_accept(2, "s1").unwrap();
    assert!(drain(&mut a).is_empty(), "second accept must not re-notify");
    assert_eq!(calls.get("s1").unwrap().state, CallState::Accepted);
}

#[test]
fn only_the_callee_may_accept() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();

    let err = calls.handle_accept(1, "s1").unwrap_err();
    assert!(matches!(err, SessionError::NotParticipant { user: 1, .. }));

    let err = calls.handle_accept(3, "s1").unwrap_err();
    assert!(matches!(err, SessionError::NotParticipant { user: 3, .. }));
}

#[test]
fn accept_of_unknown_session_is_a_violation() {
    let (_registry, calls) = setup();
    let err = calls.handle_accept(2, "ghost").unwrap_err();
    assert_eq!(err, SessionError::UnknownSession("ghost".to_string()));
}

#[test]
fn reject_forwards_reason_and_destroys_session() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Both, "s1".to_string())
        .unwrap();
    drain(&mut a);

    calls
        .handle_reject(2, "s1", Some("busy".to_string()))
        .unwrap();

    assert_eq!(
        drain(&mut a),
        vec![Envelope::CallRejected {
            contact_id: 2,
            session_id: "s1".to_string(),
            reason: Some("busy".to_string()),
            from: Some(2),
        }]
    );
    assert!(calls.get("s1").is_none());
}

#[test]
fn answer_marks_the_session_connected() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    calls.handle_accept(2, "s1").unwrap();
    drain(&mut a);
    drain(&mut b);

    let offer = signal(SignalKind::Offer, 1, 2, "s1");
    calls.handle_signal(1, &offer, signal_frame(&offer)).unwrap();
    assert_eq!(calls.get("s1").unwrap().state, CallState::Accepted);

    let answer = signal(SignalKind::Answer, 2, 1, "s1");
    calls
        .handle_signal(2, &answer, signal_frame(&answer))
        .unwrap();
    assert_eq!(calls.get("s1").unwrap().state, CallState::Connected);

    assert_eq!(drain(&mut b).len(), 1);
    assert_eq!(drain(&mut a).len(), 1);
}

#[test]
fn reject_is_invalid_once_connected() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    calls.handle_accept(2, "s1").unwrap();
    let answer = signal(SignalKind::Answer, 2, 1, "s1");
    calls
        .handle_signal(2, &answer, signal_frame(&answer))
        .unwrap();

    let err = calls.handle_reject(2, "s1", None).unwrap_err();
    assert_eq!(err, SessionError::InvalidState("s1".to_string()));
    assert!(calls.get("s1").is_some(), "an invalid reject must not destroy the call");
}

#[test]
fn signal_endpoints_must_match_the_session() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);
    let _c = connect_user(&registry, 3);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    drain(&mut b);

    // outsider as sender
    let bogus = signal(SignalKind::Offer, 3, 2, "s1");
    let err = calls.handle_signal(3, &bogus, signal_frame(&bogus)).unwrap_err();
    assert!(matches!(err, SessionError::NotParticipant { user: 3, .. }));

    // participant lying about the sender field
    let spoofed = signal(SignalKind::Offer, 2, 1, "s1");
    let err = calls
        .handle_signal(1, &spoofed, signal_frame(&spoofed))
        .unwrap_err();
    assert!(matches!(err, SessionError::NotParticipant { .. }));

    // addressee outside the session
    let misdirected = signal(SignalKind::Offer, 1, 3, "s1");
    let err = calls
        .handle_signal(1, &misdirected, signal_frame(&misdirected))
        .unwrap_err();
    assert!(matches!(err, SessionError::NotParticipant { .. }));

    assert!(drain(&mut b).is_empty(), "no invalid signal may be forwarded");
}

#[test]
fn signal_for_unknown_session_is_a_violation() {
    let (registry, calls) = setup();
    let _a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    let sig = signal(SignalKind::Offer, 1, 2, "ghost");
    let err = calls.handle_signal(1, &sig, signal_frame(&sig)).unwrap_err();
    assert_eq!(err, SessionError::UnknownSession("ghost".to_string()));
}

#[test]
fn unreachable_peer_fails_the_session() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    drain(&mut a);

    // the callee's connection vanishes without a disconnect event yet
    let stale_id = registry.get(2).unwrap().id();
    assert!(registry.unregister(2, stale_id));

    let offer = signal(SignalKind::Offer, 1, 2, "s1");
    calls.handle_signal(1, &offer, signal_frame(&offer)).unwrap();

    assert_eq!(
        drain(&mut a),
        vec![Envelope::CallEnded {
            contact_id: 2,
            session_id: "s1".to_string(),
            reason: Some("peer unreachable".to_string()),
            from: None,
        }]
    );
    assert!(calls.get("s1").is_none());
}

#[test]
fn either_party_may_end_the_call() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);

    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    drain(&mut a);
    drain(&mut b);

    // the initiator cancels while still ringing
    calls.handle_end(1, "s1").unwrap();
    assert_eq!(
        drain(&mut b),
        vec![Envelope::CallEnded {
            contact_id: 1,
            session_id: "s1".to_string(),
            reason: None,
            from: Some(1),
        }]
    );
    assert!(calls.get("s1").is_none());

    let err = calls.handle_end(1, "s1").unwrap_err();
    assert_eq!(err, SessionError::UnknownSession("s1".to_string()));
}

#[test]
fn disconnect_tears_down_every_session_of_the_user() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let _b = connect_user(&registry, 2);
    let mut c = connect_user(&registry, 3);

    // user 2 is ringing with 1 and already accepted with 3
    calls
        .handle_request(1, 2, MediaKind::Audio, "s1".to_string())
        .unwrap();
    calls
        .handle_request(3, 2, MediaKind::Video, "s2".to_string())
        .unwrap();
    calls.handle_accept(2, "s2").unwrap();
    drain(&mut a);
    drain(&mut c);

    let conn_id = registry.get(2).unwrap().id();
    assert!(registry.unregister(2, conn_id));
    calls.connection_closed(2);

    for (rx, sid) in [(&mut a, "s1"), (&mut c, "s2")] {
        assert_eq!(
            drain(rx),
            vec![Envelope::CallEnded {
                contact_id: 2,
                session_id: sid.to_string(),
                reason: Some("peer disconnected".to_string()),
                from: None,
            }],
            "each surviving peer hears exactly one call-ended"
        );
    }
    assert_eq!(calls.active_sessions(), 0);
}

#[test]
fn ring_timeout_expires_only_requested_sessions() {
    let (registry, calls) = setup();
    let mut a = connect_user(&registry, 1);
    let mut b = connect_user(&registry, 2);
    let mut c = connect_user(&registry, 3);
    let _d = connect_user(&registry, 4);

    calls
        .handle_request(1, 2, MediaKind::Audio, "ringing".to_string())
        .unwrap();
    calls
        .handle_request(3, 4, MediaKind::Audio, "answered".to_string())
        .unwrap();
    calls.handle_accept(4, "answered").unwrap();
    drain(&mut a);
    drain(&mut b);
    drain(&mut c);

    let expired = calls.expire_stale_requests(Duration::ZERO);
    assert_eq!(expired, 1);

    assert_eq!(
        drain(&mut a),
        vec![Envelope::CallRejected {
            contact_id: 2,
            session_id: "ringing".to_string(),
            reason: Some("ring timeout".to_string()),
            from: None,
        }]
    );
    assert_eq!(
        drain(&mut b),
        vec![Envelope::CallEnded {
            contact_id: 1,
            session_id: "ringing".to_string(),
            reason: Some("ring timeout".to_string()),
            from: None,
        }]
    );
    assert!(calls.get("ringing").is_none());
    assert_eq!(calls.get("answered").unwrap().state, CallState::Accepted);
}
