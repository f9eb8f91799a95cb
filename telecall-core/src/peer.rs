//! Peer connection contract
//!
//! The negotiation state machine drives a peer connection only through
//! [`PeerConnection`]. Connection events are not callbacks: the factory is
//! handed one [`PeerEventSender`] at construction and forwards every ICE
//! candidate, remote track and ICE state change through it, so handlers are
//! registered exactly once per connection.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{IceCandidate, IceServer, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Connection could not be created
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// SDP generation or application failed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Track could not be added or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Candidate could not be applied
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Unknown sender handle
    #[error("Sender not found: {0}")]
    SenderNotFound(SenderId),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Handle to an outgoing RTP sender, stable across track replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// ICE connection state as reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceConnectionState {
    /// Gathering has not started
    New,
    /// Connectivity checks running
    Checking,
    /// A working candidate pair was found
    Connected,
    /// Checks finished with a working pair
    Completed,
    /// Connectivity lost
    Disconnected,
    /// No working pair
    Failed,
    /// Transport shut down
    Closed,
}

impl IceConnectionState {
    /// Media is flowing
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// The call cannot continue
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Event raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered
    IceCandidate(IceCandidate),
    /// A remote track arrived
    Track(RemoteTrack),
    /// The ICE connection state changed
    IceConnectionStateChange(IceConnectionState),
}

/// Sending half handed to the factory for event delivery
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Operations the negotiation needs from a peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach an outgoing track, returning its sender
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError>;

    /// Swap the track feeding `sender` in place, without renegotiation
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), PeerError>;

    /// Generate an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Generate an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection and release its transports
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections configured with ICE servers
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection that reports its events on `events`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
