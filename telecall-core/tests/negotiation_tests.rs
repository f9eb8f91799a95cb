//! Negotiation state machine tests against recording doubles
//!
//! Covers the remote-description guard, the early-candidate queue and the
//! order in which setup touches the signaling channel.

mod common;

use common::{channel, FakeDevices, PeerCall, RecordingPeer};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use telecall_core::{
    CallDocument, CallId, CallRole, CandidateRole, CaptureConstraints, IceCandidate,
    IceConnectionState, MediaError, MediaSession, MemoryStore, NegotiationError, NegotiationInput,
    NegotiationState, Negotiator, PeerEvent, Progress, RemoteTrack, SdpType, SessionDescription,
    SignalingChannel, TrackKind,
};
use tokio::sync::mpsc;

struct Fixture {
    store: Arc<MemoryStore>,
    signaling: SignalingChannel,
    peer: Arc<RecordingPeer>,
    media: MediaSession,
    negotiator: Negotiator,
    events: mpsc::UnboundedSender<PeerEvent>,
}

fn fixture(role: CallRole, devices: FakeDevices) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let signaling = channel(&store);
    let peer = Arc::new(RecordingPeer::default());
    let (events, events_rx) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(
        CallId::new("doc1_pat2"),
        role,
        peer.clone(),
        signaling.clone(),
        events_rx,
    );
    let media = MediaSession::new(Arc::new(devices), CaptureConstraints::video_call());
    Fixture {
        store,
        signaling,
        peer,
        media,
        negotiator,
        events,
    }
}

fn call_id() -> CallId {
    CallId::new("doc1_pat2")
}

fn offer_doc() -> CallDocument {
    CallDocument {
        offer: Some(SessionDescription::offer("v=0 remote-offer")),
        answer: None,
    }
}

/// Feed inputs until `done` holds or the inputs dry up
async fn pump(fx: &mut Fixture, done: impl Fn(&Fixture) -> bool) {
    for _ in 0..50 {
        if done(&*fx) {
            return;
        }
        let input = tokio::time::timeout(Duration::from_millis(200), fx.negotiator.next_input())
            .await
            .ok()
            .flatten();
        let Some(input) = input else {
            return;
        };
        fx.negotiator.handle(input, &mut fx.media).await.unwrap();
    }
}

#[tokio::test]
async fn caller_publishes_offer_after_attaching_media() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    assert_eq!(fx.negotiator.state(), NegotiationState::HaveLocalDescription);
    let calls = fx.peer.calls();
    assert!(matches!(calls[0], PeerCall::AddTrack { .. }));
    assert!(matches!(calls[1], PeerCall::AddTrack { .. }));
    assert_eq!(
        calls[2..].to_vec(),
        vec![PeerCall::CreateOffer, PeerCall::SetLocal(SdpType::Offer)]
    );

    let doc = fx.signaling.read_call(&call_id()).await.unwrap();
    assert!(doc.usable_offer().is_some());
    assert_eq!(doc.answer, None);
    assert!(fx.negotiator.has_published());
}

#[tokio::test]
async fn caller_offer_clears_answer_from_an_earlier_call() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.signaling
        .write_offer(&call_id(), &SessionDescription::offer("v=0 earlier-offer"))
        .await
        .unwrap();
    fx.signaling
        .write_answer(&call_id(), &SessionDescription::answer("v=0 earlier-answer"))
        .await
        .unwrap();

    fx.negotiator.start(&mut fx.media).await.unwrap();
    // Drains the initial snapshot, then goes idle
    pump(&mut fx, |_| false).await;

    assert_eq!(fx.peer.set_remote_count(), 0);
    assert_eq!(fx.negotiator.state(), NegotiationState::HaveLocalDescription);
    let doc = fx.signaling.read_call(&call_id()).await.unwrap();
    assert_eq!(doc.answer, None);
}

#[tokio::test]
async fn callee_ignores_duplicate_offer_notifications() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.signaling
        .write_offer(&call_id(), offer_doc().offer.as_ref().unwrap())
        .await
        .unwrap();
    fx.negotiator.start(&mut fx.media).await.unwrap();
    assert_eq!(fx.negotiator.state(), NegotiationState::Connecting);

    // Snapshot from the subscription, then the same content fired twice more
    pump(&mut fx, |fx| fx.peer.set_remote_count() > 0).await;
    for _ in 0..2 {
        fx.negotiator
            .handle(NegotiationInput::CallDocument(offer_doc()), &mut fx.media)
            .await
            .unwrap();
    }

    assert_eq!(fx.peer.set_remote_count(), 1);
    assert_eq!(fx.peer.count(|c| *c == PeerCall::CreateAnswer), 1);
    assert_eq!(fx.negotiator.state(), NegotiationState::HaveRemoteDescription);

    let doc = fx.signaling.read_call(&call_id()).await.unwrap();
    assert_eq!(doc.usable_answer().map(|a| a.sdp_type), Some(SdpType::Answer));
    assert!(doc.usable_offer().is_some());
    assert!(fx.negotiator.has_published());
}

#[tokio::test]
async fn callee_waits_for_a_usable_offer() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    let empty = CallDocument {
        offer: Some(SessionDescription::offer("")),
        answer: None,
    };
    fx.negotiator
        .handle(NegotiationInput::CallDocument(empty), &mut fx.media)
        .await
        .unwrap();
    fx.negotiator
        .handle(NegotiationInput::CallDocument(CallDocument::default()), &mut fx.media)
        .await
        .unwrap();

    assert_eq!(fx.peer.set_remote_count(), 0);
    assert_eq!(fx.negotiator.state(), NegotiationState::Connecting);
    assert!(!fx.negotiator.has_published());
}

#[tokio::test]
async fn caller_applies_answer_once() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    let answered = CallDocument {
        offer: Some(SessionDescription::offer("v=0 local-offer")),
        answer: Some(SessionDescription::answer("v=0 remote-answer")),
    };
    for _ in 0..3 {
        fx.negotiator
            .handle(NegotiationInput::CallDocument(answered.clone()), &mut fx.media)
            .await
            .unwrap();
    }

    assert_eq!(fx.peer.set_remote_count(), 1);
    assert_eq!(
        fx.peer.position(|c| *c == PeerCall::SetRemote(SdpType::Answer)),
        Some(fx.peer.calls().len() - 1)
    );
    assert_eq!(fx.negotiator.state(), NegotiationState::HaveRemoteDescription);
}

#[tokio::test]
async fn early_candidates_wait_for_remote_description() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    for i in 0..3 {
        fx.negotiator
            .handle(
                NegotiationInput::RemoteCandidate(IceCandidate::new(format!("candidate:{i}"))),
                &mut fx.media,
            )
            .await
            .unwrap();
    }
    assert_eq!(fx.negotiator.pending_candidates(), 3);
    assert!(fx.peer.applied_candidates().is_empty());

    fx.negotiator
        .handle(NegotiationInput::CallDocument(offer_doc()), &mut fx.media)
        .await
        .unwrap();

    let set_remote = fx
        .peer
        .position(|c| matches!(c, PeerCall::SetRemote(_)))
        .unwrap();
    let first_candidate = fx
        .peer
        .position(|c| matches!(c, PeerCall::AddCandidate(_)))
        .unwrap();
    assert!(first_candidate > set_remote);
    assert_eq!(
        fx.peer.applied_candidates(),
        vec!["candidate:0", "candidate:1", "candidate:2"]
    );
    assert_eq!(fx.negotiator.pending_candidates(), 0);

    // Later arrivals go straight through
    fx.negotiator
        .handle(
            NegotiationInput::RemoteCandidate(IceCandidate::new("candidate:3")),
            &mut fx.media,
        )
        .await
        .unwrap();
    assert_eq!(fx.peer.applied_candidates().len(), 4);
}

#[tokio::test]
async fn caller_never_applies_candidates_before_answer() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    for i in 0..3 {
        fx.signaling
            .append_candidate(
                &call_id(),
                CandidateRole::Answerer,
                &IceCandidate::new(format!("candidate:{i}")),
            )
            .await
            .unwrap();
    }
    fx.signaling
        .write_answer(&call_id(), &SessionDescription::answer("v=0 remote-answer"))
        .await
        .unwrap();

    pump(&mut fx, |fx| fx.peer.applied_candidates().len() == 3).await;

    let set_remote = fx
        .peer
        .position(|c| matches!(c, PeerCall::SetRemote(_)))
        .unwrap();
    let first_candidate = fx
        .peer
        .position(|c| matches!(c, PeerCall::AddCandidate(_)))
        .unwrap();
    assert!(first_candidate > set_remote);
    assert_eq!(
        fx.peer.applied_candidates(),
        vec!["candidate:0", "candidate:1", "candidate:2"]
    );
    assert_eq!(fx.peer.set_remote_count(), 1);
}

#[tokio::test]
async fn media_failure_aborts_before_signaling() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::denying());
    let result = fx.negotiator.start(&mut fx.media).await;

    assert!(matches!(
        result,
        Err(NegotiationError::Media(MediaError::PermissionDenied(_)))
    ));
    assert_eq!(fx.negotiator.state(), NegotiationState::Failed);
    assert_eq!(fx.store.merge_count(), 0);
    assert!(fx.peer.calls().is_empty());
    assert!(!fx.negotiator.has_published());
}

#[tokio::test]
async fn offer_write_failure_fails_negotiation() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.store.set_offline(true);

    let result = fx.negotiator.start(&mut fx.media).await;
    assert!(matches!(result, Err(NegotiationError::Signaling(_))));
    assert_eq!(fx.negotiator.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn local_candidates_go_to_own_sequence() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    fx.events
        .send(PeerEvent::IceCandidate(IceCandidate::new("candidate:local")))
        .unwrap();
    let own_path = SignalingChannel::candidates_path(&call_id(), CandidateRole::Offerer);
    pump(&mut fx, |fx| fx.store.child_count(&own_path) == 1).await;

    let own = SignalingChannel::candidates_path(&call_id(), CandidateRole::Offerer);
    let other = SignalingChannel::candidates_path(&call_id(), CandidateRole::Answerer);
    assert_eq!(fx.store.child_count(&own), 1);
    assert_eq!(fx.store.child_count(&other), 0);
}

#[tokio::test]
async fn candidate_append_failure_is_tolerated() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();
    fx.store.set_offline(true);

    let progress = fx
        .negotiator
        .handle(
            NegotiationInput::Peer(PeerEvent::IceCandidate(IceCandidate::new("candidate:lost"))),
            &mut fx.media,
        )
        .await
        .unwrap();
    assert_eq!(progress, Progress::Continue);
    assert_eq!(fx.negotiator.state(), NegotiationState::Connecting);
}

#[tokio::test]
async fn ice_states_drive_connection_state() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();
    fx.negotiator
        .handle(NegotiationInput::CallDocument(offer_doc()), &mut fx.media)
        .await
        .unwrap();

    let connected = fx
        .negotiator
        .handle(
            NegotiationInput::Peer(PeerEvent::IceConnectionStateChange(
                IceConnectionState::Connected,
            )),
            &mut fx.media,
        )
        .await
        .unwrap();
    assert_eq!(connected, Progress::Continue);
    assert_eq!(fx.negotiator.state(), NegotiationState::Connected);

    let failed = fx
        .negotiator
        .handle(
            NegotiationInput::Peer(PeerEvent::IceConnectionStateChange(IceConnectionState::Failed)),
            &mut fx.media,
        )
        .await
        .unwrap();
    assert_eq!(failed, Progress::Terminated(IceConnectionState::Failed));
    assert_eq!(fx.negotiator.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn remote_tracks_reach_media_session() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    fx.negotiator
        .handle(
            NegotiationInput::Peer(PeerEvent::Track(RemoteTrack {
                id: "remote-audio".to_string(),
                stream_id: "remote".to_string(),
                kind: TrackKind::Audio,
            })),
            &mut fx.media,
        )
        .await
        .unwrap();

    let remote = fx.media.snapshot().remote.unwrap();
    assert_eq!(remote.tracks.len(), 1);
    assert_eq!(remote.tracks[0].id, "remote-audio");
}

#[tokio::test]
async fn cancelled_subscriptions_deliver_nothing() {
    let mut fx = fixture(CallRole::Caller, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();
    fx.negotiator.cancel_subscriptions();

    fx.signaling
        .write_answer(&call_id(), &SessionDescription::answer("v=0 late-answer"))
        .await
        .unwrap();
    fx.signaling
        .append_candidate(&call_id(), CandidateRole::Answerer, &IceCandidate::new("candidate:late"))
        .await
        .unwrap();
    let _ = fx.events.send(PeerEvent::IceCandidate(IceCandidate::new("candidate:local")));

    let next = tokio::time::timeout(Duration::from_millis(100), fx.negotiator.next_input()).await;
    assert!(matches!(next, Err(_) | Ok(None)));
    assert_eq!(fx.peer.set_remote_count(), 0);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let mut fx = fixture(CallRole::Callee, FakeDevices::default());
    fx.negotiator.start(&mut fx.media).await.unwrap();

    let again = fx.negotiator.start(&mut fx.media).await;
    assert!(matches!(
        again,
        Err(NegotiationError::InvalidTransition {
            from: NegotiationState::Connecting,
            to: NegotiationState::Connecting,
        })
    ));
}
