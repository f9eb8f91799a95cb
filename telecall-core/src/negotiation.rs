//! Call negotiation state machine
//!
//! Drives one peer connection through offer/answer and candidate exchange.
//!
//! ```text
//!     Idle
//!       │ start
//!       ▼
//!   Connecting ─────────────────────────────┐
//!       │ caller: offer written             │ callee: offer applied
//!       ▼                                   │
//!  HaveLocalDescription                     │
//!       │ caller: answer applied            │
//!       ▼                                   ▼
//!  HaveRemoteDescription ◄──────────────────┘
//!       │ ICE connected/completed
//!       ▼
//!   Connected
//!
//!  any non-terminal state ──► Failed | Closed
//! ```
//!
//! Two orderings are enforced here because the call document and the
//! candidate sequence are delivered by independent subscriptions:
//!
//! - the remote description is applied at most once. Repeated notifications
//!   carrying the same offer or answer are recognised by the state alone,
//!   never by comparing content;
//! - a remote candidate is never applied before the remote description. Early
//!   candidates wait in a FIFO queue that is drained, in arrival order, as soon
//!   as `set_remote_description` resolves.
//!
//! All inputs are processed one at a time by the owner's event loop, so no
//! handler ever observes another one half-way through.

use crate::identity::CallId;
use crate::media::{MediaError, MediaSession};
use crate::peer::{IceConnectionState, PeerConnection, PeerError, PeerEvent};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::store::Subscription;
use crate::types::{CallDocument, CallRole, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// Local media could not be acquired or attached
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Offer/answer could not be generated or applied
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Offer/answer could not be written or a subscription opened
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// A transition the state machine forbids
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: NegotiationState,
        /// Requested state
        to: NegotiationState,
    },
}

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// Not started
    Idle,
    /// Media being attached, first description being produced
    Connecting,
    /// Offer applied locally and published; waiting for the answer
    HaveLocalDescription,
    /// Remote description applied; candidates flow directly
    HaveRemoteDescription,
    /// ICE connected
    Connected,
    /// Closed by teardown
    Closed,
    /// Unrecoverable negotiation or ICE failure
    Failed,
}

impl NegotiationState {
    /// Whether the machine may move from `self` to `next`
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Closed | Failed) => true,
            (Idle, Connecting)
            | (Connecting, HaveLocalDescription)
            | (Connecting, HaveRemoteDescription)
            | (HaveLocalDescription, HaveRemoteDescription)
            | (HaveRemoteDescription, Connected) => true,
            _ => false,
        }
    }

    /// The remote description has been applied
    #[must_use]
    pub fn has_remote_description(self) -> bool {
        matches!(self, Self::HaveRemoteDescription | Self::Connected)
    }

    /// No further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// One input for the state machine
#[derive(Debug, Clone)]
pub enum NegotiationInput {
    /// Call document snapshot
    CallDocument(CallDocument),
    /// Candidate from the other role's sequence
    RemoteCandidate(IceCandidate),
    /// Peer connection event
    Peer(PeerEvent),
}

/// What the owner should do after an input was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep processing inputs
    Continue,
    /// The connection reached a terminal ICE state; tear the call down
    Terminated(IceConnectionState),
}

/// Negotiation for one call and one peer connection
pub struct Negotiator {
    call_id: CallId,
    role: CallRole,
    state: NegotiationState,
    peer: Arc<dyn PeerConnection>,
    signaling: SignalingChannel,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    call_updates: Option<Subscription<CallDocument>>,
    remote_candidates: Option<Subscription<IceCandidate>>,
    pending_candidates: VecDeque<IceCandidate>,
    published: bool,
}

impl Negotiator {
    /// Create an idle negotiator; `peer_events` is the receiving half of the
    /// sender given to the peer connection factory
    #[must_use]
    pub fn new(
        call_id: CallId,
        role: CallRole,
        peer: Arc<dyn PeerConnection>,
        signaling: SignalingChannel,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        Self {
            call_id,
            role,
            state: NegotiationState::Idle,
            peer,
            signaling,
            peer_events,
            call_updates: None,
            remote_candidates: None,
            pending_candidates: VecDeque::new(),
            published: false,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Role of this device
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Remote candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether this side wrote its offer or answer
    #[must_use]
    pub fn has_published(&self) -> bool {
        self.published
    }

    fn transition(&mut self, next: NegotiationState) -> Result<(), NegotiationError> {
        if !self.state.can_transition_to(next) {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?self.state,
            new_state = ?next,
            "Negotiation state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = NegotiationState::Failed;
        }
    }

    /// Move to `Closed` unless already terminal
    pub fn mark_closed(&mut self) {
        if !self.state.is_terminal() {
            self.state = NegotiationState::Closed;
        }
    }

    /// Start negotiating: acquire and attach local media, then follow the
    /// role's path. No signaling write happens unless media is in place.
    ///
    /// # Errors
    ///
    /// Returns error if media, SDP generation, the offer write or a
    /// subscription fails; the state is then `Failed`
    #[tracing::instrument(skip(self, media), fields(call_id = %self.call_id, role = %self.role))]
    pub async fn start(&mut self, media: &mut MediaSession) -> Result<(), NegotiationError> {
        self.transition(NegotiationState::Connecting)?;
        let result = self.start_role(media).await;
        if result.is_err() {
            self.fail();
        }
        result
    }

    async fn start_role(&mut self, media: &mut MediaSession) -> Result<(), NegotiationError> {
        media.acquire_local().await?;
        media.attach_to(self.peer.as_ref()).await?;

        match self.role {
            CallRole::Caller => {
                let offer = self.peer.create_offer().await?;
                self.peer.set_local_description(offer.clone()).await?;
                self.signaling.reset_call(&self.call_id).await?;
                self.signaling.write_offer(&self.call_id, &offer).await?;
                self.published = true;
                self.transition(NegotiationState::HaveLocalDescription)?;
                tracing::info!(call_id = %self.call_id, "Offer published");

                self.call_updates = Some(self.signaling.subscribe_to_call(&self.call_id).await?);
                self.subscribe_remote_candidates().await?;
            }
            CallRole::Callee => {
                self.call_updates = Some(self.signaling.subscribe_to_call(&self.call_id).await?);
            }
        }
        Ok(())
    }

    async fn subscribe_remote_candidates(&mut self) -> Result<(), NegotiationError> {
        if self.remote_candidates.is_none() {
            let subscription = self
                .signaling
                .subscribe_to_candidates(&self.call_id, self.role.remote_candidates())
                .await?;
            self.remote_candidates = Some(subscription);
        }
        Ok(())
    }

    /// Wait for the next input from the peer connection or either
    /// subscription. Returns `None` once every source is closed.
    pub async fn next_input(&mut self) -> Option<NegotiationInput> {
        let Self {
            peer_events,
            call_updates,
            remote_candidates,
            ..
        } = self;

        tokio::select! {
            Some(event) = peer_events.recv() => Some(NegotiationInput::Peer(event)),
            Some(doc) = recv_from(call_updates) => Some(NegotiationInput::CallDocument(doc)),
            Some(candidate) = recv_from(remote_candidates) => {
                Some(NegotiationInput::RemoteCandidate(candidate))
            }
            else => None,
        }
    }

    /// Handle one input
    ///
    /// # Errors
    ///
    /// Returns error on an unrecoverable negotiation failure; the state is
    /// then `Failed`
    pub async fn handle(
        &mut self,
        input: NegotiationInput,
        media: &mut MediaSession,
    ) -> Result<Progress, NegotiationError> {
        if self.state.is_terminal() {
            return Ok(Progress::Continue);
        }
        let result = match input {
            NegotiationInput::CallDocument(doc) => self.on_call_document(doc).await,
            NegotiationInput::RemoteCandidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Ok(Progress::Continue)
            }
            NegotiationInput::Peer(event) => Ok(self.on_peer_event(event, media).await),
        };
        if result.is_err() {
            self.fail();
        }
        result
    }

    /// Apply the relevant description from a call document snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the description cannot be applied or the answer
    /// cannot be produced and published
    pub async fn on_call_document(&mut self, doc: CallDocument) -> Result<Progress, NegotiationError> {
        if self.state.has_remote_description() {
            return Ok(Progress::Continue);
        }
        match self.role {
            CallRole::Caller => {
                if let Some(answer) = doc.usable_answer() {
                    self.apply_remote_description(answer.clone()).await?;
                }
            }
            CallRole::Callee => {
                if let Some(offer) = doc.usable_offer() {
                    self.apply_remote_description(offer.clone()).await?;

                    let answer = self.peer.create_answer().await?;
                    self.peer.set_local_description(answer.clone()).await?;
                    self.signaling.write_answer(&self.call_id, &answer).await?;
                    self.published = true;
                    tracing::info!(call_id = %self.call_id, "Answer published");

                    self.subscribe_remote_candidates().await?;
                }
            }
        }
        Ok(Progress::Continue)
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        // Checked before the await so the transition below cannot fail
        if !self
            .state
            .can_transition_to(NegotiationState::HaveRemoteDescription)
        {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: NegotiationState::HaveRemoteDescription,
            });
        }
        self.peer.set_remote_description(description).await?;
        self.transition(NegotiationState::HaveRemoteDescription)?;

        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
        if queued > 0 {
            tracing::debug!(call_id = %self.call_id, queued, "Drained queued ICE candidates");
        }
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.has_remote_description() {
            self.apply_candidate(candidate).await;
        } else {
            tracing::trace!(call_id = %self.call_id, "Queueing early ICE candidate");
            self.pending_candidates.push_back(candidate);
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to apply ICE candidate");
        }
    }

    /// React to a peer connection event
    pub async fn on_peer_event(&mut self, event: PeerEvent, media: &mut MediaSession) -> Progress {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                // Loss is tolerable: ICE gathers redundant candidates
                if let Err(e) = self
                    .signaling
                    .append_candidate(&self.call_id, self.role.own_candidates(), &candidate)
                    .await
                {
                    tracing::debug!(call_id = %self.call_id, error = %e, "Dropped local ICE candidate");
                }
                Progress::Continue
            }
            PeerEvent::Track(track) => {
                media.add_remote_track(track);
                Progress::Continue
            }
            PeerEvent::IceConnectionStateChange(ice_state) => {
                tracing::info!(call_id = %self.call_id, ?ice_state, "ICE connection state changed");
                if ice_state.is_terminal() {
                    if ice_state == IceConnectionState::Failed {
                        self.fail();
                    }
                    return Progress::Terminated(ice_state);
                }
                if ice_state.is_established() && self.state != NegotiationState::Connected {
                    if let Err(e) = self.transition(NegotiationState::Connected) {
                        tracing::debug!(error = %e, "Ignoring early ICE connected state");
                    }
                }
                Progress::Continue
            }
        }
    }

    /// Cancel both signaling subscriptions and stop reading peer events.
    /// Nothing is delivered to this negotiator afterwards.
    pub fn cancel_subscriptions(&mut self) {
        if let Some(mut subscription) = self.call_updates.take() {
            subscription.cancel();
        }
        if let Some(mut subscription) = self.remote_candidates.take() {
            subscription.cancel();
        }
        self.peer_events.close();
        self.pending_candidates.clear();
    }
}

async fn recv_from<T>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
