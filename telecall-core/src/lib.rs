//! Telecall core - peer-to-peer call signaling and negotiation
//!
//! This library establishes a direct audio/video connection between two call
//! participants using offer/answer/ICE negotiation coordinated through a
//! shared store. It features:
//!
//! - **Deterministic call identifiers**: both sides derive the same id from
//!   the participant pair, no lookup needed
//! - **Store-backed signaling**: call document plus two append-only candidate
//!   sequences, replayed to late subscribers
//! - **Order-safe negotiation**: the remote description is applied once, and
//!   early candidates are queued until it is
//! - **Media session management**: mute, video toggle and camera switch
//!   without renegotiation
//! - **Idempotent teardown**: hang-up, ICE loss and answer timeout all end
//!   in the same single cleanup
//!
//! # Examples
//!
//! ```rust,no_run
//! use telecall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(devices: Arc<dyn MediaDevices>) -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let signaling = SignalingChannel::new(store.clone(), store.clone());
//! let deps = CallDependencies::new(
//!     signaling,
//!     Arc::new(StaticIceServers::default()),
//!     Arc::new(WebRtcPeerConnectionFactory::new()?),
//!     devices,
//! );
//!
//! let controller = CallController::new(deps, CallConfig::default());
//! let call = controller.place_call(CallParticipants::new("doc1", "pat2"));
//! assert_eq!(call.call_id().as_str(), "doc1_pat2");
//!
//! call.wait_connected().await;
//! call.toggle_microphone().await?;
//! call.hang_up().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Participant and call identifiers
pub mod identity;

/// Signaling data transfer objects
pub mod types;

/// Backing store contracts and in-memory store
pub mod store;

/// Signaling channel
pub mod signaling;

/// ICE credential provider
pub mod ice;

/// Peer connection contract
pub mod peer;

/// Local and remote media
pub mod media;

/// Offer/answer/candidate state machine
pub mod negotiation;

/// External collaborators: active-call flag and callee notification
pub mod external;

/// Call lifecycle controller
pub mod call;

/// Peer connections over the webrtc crate
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use call::{
    CallConfig, CallController, CallDependencies, CallError, CallHandle, CallPhase, CallStatus,
    EndReason,
};
pub use external::{
    ActiveCallFlag, CalleeNotifier, DocumentActiveCallFlag, NoopNotifier, ACTIVE_CALL_FIELD,
};
pub use ice::{
    parse_ice_servers, resolve_ice_servers, stun_only, HttpIceCredentialProvider, IceCredentialProvider,
    IceError, StaticIceServers, DEFAULT_STUN_URLS,
};
pub use identity::{CallId, CallParticipants, ParticipantId, CALL_ID_SEPARATOR};
pub use media::{
    CaptureConstraints, FacingMode, LocalTrack, MediaDevices, MediaError, MediaEvent, MediaSession,
    MediaSnapshot, MediaStream, RemoteTrack, TrackInfo, TrackKind,
};
pub use negotiation::{NegotiationError, NegotiationInput, NegotiationState, Negotiator, Progress};
pub use peer::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender,
    SenderId,
};
pub use signaling::{SignalingChannel, SignalingError};
pub use store::{AppendLog, DocumentStore, MemoryStore, StoreError, Subscription};
pub use types::{
    CallDocument, CallRole, CandidateRole, IceCandidate, IceServer, SdpType, SessionDescription,
};
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcPeerConnection, WebRtcPeerConnectionFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{
        CallConfig, CallController, CallDependencies, CallError, CallHandle, CallPhase, CallStatus,
        EndReason,
    };
    pub use crate::ice::{HttpIceCredentialProvider, IceCredentialProvider, StaticIceServers};
    pub use crate::identity::{CallId, CallParticipants, ParticipantId};
    pub use crate::media::{CaptureConstraints, FacingMode, LocalTrack, MediaDevices, TrackKind};
    pub use crate::signaling::SignalingChannel;
    pub use crate::store::MemoryStore;
    pub use crate::types::{CallRole, IceServer, SessionDescription};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::WebRtcPeerConnectionFactory;
}
