//! Call lifecycle controller
//!
//! One spawned task owns everything a call holds: the peer connection, the
//! negotiator with its subscriptions, and the media session. [`CallHandle`]s
//! talk to that task through a command channel and observe it through a
//! status watch, so all call logic runs on a single event loop.
//!
//! ```text
//!   Setup ──► Active ──► TornDown
//!     │                     ▲
//!     └─────────────────────┘  (setup failure)
//! ```
//!
//! Teardown runs exactly once per call, whichever of hang-up, terminal ICE
//! state, answer timeout or dropping every handle comes first.

use crate::external::{ActiveCallFlag, CalleeNotifier, NoopNotifier};
use crate::ice::{resolve_ice_servers, IceCredentialProvider, DEFAULT_STUN_URLS};
use crate::identity::{CallId, CallParticipants};
use crate::media::{
    CaptureConstraints, FacingMode, MediaDevices, MediaError, MediaEvent, MediaSession,
    MediaSnapshot,
};
use crate::negotiation::{NegotiationError, NegotiationInput, NegotiationState, Negotiator, Progress};
use crate::peer::{IceConnectionState, PeerConnection, PeerConnectionFactory, PeerError};
use crate::signaling::SignalingChannel;
use crate::types::CallRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Capacity of the per-call command channel
const COMMAND_CAPACITY: usize = 32;

/// Call lifecycle errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Media could not be acquired or changed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Negotiation failed
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Peer connection could not be created
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// The call has already been torn down
    #[error("Call has ended")]
    CallEnded,
}

/// Call configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
    /// Camera opened at call start
    pub facing_mode: FacingMode,
    /// Requested video frame rate
    pub frame_rate: u32,
    /// STUN URLs used when ICE credentials cannot be fetched
    pub stun_fallback: Vec<String>,
    /// Give up when no remote description arrives in time; `None` waits
    /// until hang-up
    #[serde(default)]
    pub answer_timeout: Option<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            facing_mode: FacingMode::User,
            frame_rate: 30,
            stun_fallback: DEFAULT_STUN_URLS.iter().map(|url| (*url).to_string()).collect(),
            answer_timeout: None,
        }
    }
}

impl CallConfig {
    /// Audio-only configuration
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }

    /// Capture constraints derived from this configuration
    #[must_use]
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            audio: self.audio,
            video: self.video,
            facing_mode: self.facing_mode,
            frame_rate: self.frame_rate,
        }
    }
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallPhase {
    /// Resolving ICE servers, creating the connection, starting negotiation
    Setup,
    /// Negotiation dispatched; waiting for or carrying media
    Active,
    /// Every resource released
    TornDown,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local hang-up, or every handle dropped
    HangUp,
    /// ICE reached a terminal state
    ConnectionLost(IceConnectionState),
    /// No remote description before the answer timeout
    Unanswered,
    /// Setup failed before negotiation was dispatched
    SetupFailed,
    /// Negotiation failed mid-call
    NegotiationFailed,
}

/// Observable call state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStatus {
    /// Call identifier
    pub call_id: CallId,
    /// Role of this device
    pub role: CallRole,
    /// Lifecycle phase
    pub phase: CallPhase,
    /// Negotiation state
    pub negotiation: NegotiationState,
    /// Last error, for display
    pub last_error: Option<String>,
    /// Set once torn down
    pub end_reason: Option<EndReason>,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
}

/// Everything a call needs from its surroundings
#[derive(Clone)]
pub struct CallDependencies {
    /// Signaling channel
    pub signaling: SignalingChannel,
    /// ICE credential source
    pub ice: Arc<dyn IceCredentialProvider>,
    /// Peer connection factory
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// Capture devices
    pub devices: Arc<dyn MediaDevices>,
    /// "Call in progress" flag, if the deployment keeps one
    pub active_flag: Option<Arc<dyn ActiveCallFlag>>,
    /// Callee notification dispatch
    pub notifier: Arc<dyn CalleeNotifier>,
}

impl CallDependencies {
    /// Dependencies without an active-call flag or notifier
    #[must_use]
    pub fn new(
        signaling: SignalingChannel,
        ice: Arc<dyn IceCredentialProvider>,
        peers: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            signaling,
            ice,
            peers,
            devices,
            active_flag: None,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Set the active-call flag
    #[must_use]
    pub fn with_active_flag(mut self, flag: Arc<dyn ActiveCallFlag>) -> Self {
        self.active_flag = Some(flag);
        self
    }

    /// Set the callee notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn CalleeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Starts call sessions
pub struct CallController {
    deps: CallDependencies,
    config: CallConfig,
}

impl CallController {
    /// Create a controller
    #[must_use]
    pub fn new(deps: CallDependencies, config: CallConfig) -> Self {
        Self { deps, config }
    }

    /// Configuration applied to new calls
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Start a call as the caller
    #[must_use]
    pub fn place_call(&self, participants: CallParticipants) -> CallHandle {
        self.start(participants, CallRole::Caller)
    }

    /// Join a call as the callee
    #[must_use]
    pub fn join_call(&self, participants: CallParticipants) -> CallHandle {
        self.start(participants, CallRole::Callee)
    }

    /// Spawn a call session. Setup runs on the session task; failures show
    /// up in the handle's status. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(&self, participants: CallParticipants, role: CallRole) -> CallHandle {
        let call_id = participants.call_id();
        tracing::info!(call_id = %call_id, %role, remote = %participants.remote, "Starting call");

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(CallStatus {
            call_id: call_id.clone(),
            role,
            phase: CallPhase::Setup,
            negotiation: NegotiationState::Idle,
            last_error: None,
            end_reason: None,
            updated_at: Utc::now(),
        });
        let media = MediaSession::new(self.deps.devices.clone(), self.config.capture_constraints());
        let handle = CallHandle {
            call_id: call_id.clone(),
            commands: commands_tx,
            status: status_rx,
            media: media.watch_snapshot(),
            media_events: media.event_sender(),
        };

        let session = CallSession {
            call_id,
            participants,
            role,
            config: self.config.clone(),
            deps: self.deps.clone(),
            media,
            negotiator: None,
            peer: None,
            status: status_tx,
            flag_set: false,
            torn_down: false,
        };
        tokio::spawn(session.run(commands_rx));
        handle
    }
}

enum Command {
    HangUp,
    SwitchCamera(oneshot::Sender<Result<FacingMode, CallError>>),
    SetMicrophone(bool, oneshot::Sender<Result<(), CallError>>),
    SetCamera(bool, oneshot::Sender<Result<(), CallError>>),
    ToggleMicrophone(oneshot::Sender<Result<bool, CallError>>),
    ToggleCamera(oneshot::Sender<Result<bool, CallError>>),
}

/// Handle to a running call. Dropping every clone hangs up.
#[derive(Clone)]
pub struct CallHandle {
    call_id: CallId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CallStatus>,
    media: watch::Receiver<MediaSnapshot>,
    media_events: broadcast::Sender<MediaEvent>,
}

impl CallHandle {
    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Current local and remote streams
    #[must_use]
    pub fn media(&self) -> MediaSnapshot {
        self.media.borrow().clone()
    }

    /// Watch local and remote streams
    #[must_use]
    pub fn watch_media(&self) -> watch::Receiver<MediaSnapshot> {
        self.media.clone()
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_media_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.media_events.subscribe()
    }

    /// Wait until the call reaches `phase` or a later one
    pub async fn wait_for_phase(&self, phase: CallPhase) -> CallStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.phase >= phase).await.map(|s| s.clone());
        match reached {
            Ok(s) => s,
            Err(_) => status.borrow().clone(),
        }
    }

    /// Wait until the negotiation is connected. Returns the final status
    /// instead if the call ends first.
    pub async fn wait_connected(&self) -> CallStatus {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.negotiation == NegotiationState::Connected || s.phase == CallPhase::TornDown)
            .await
            .map(|s| s.clone());
        match reached {
            Ok(s) => s,
            Err(_) => status.borrow().clone(),
        }
    }

    /// Hang up and wait for teardown. Safe to call any number of times, from
    /// any clone, including after the call already ended.
    pub async fn hang_up(&self) -> CallStatus {
        if self.commands.send(Command::HangUp).await.is_err() {
            tracing::debug!(call_id = %self.call_id, "Hang-up after call ended");
        }
        self.wait_for_phase(CallPhase::TornDown).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> Command,
    ) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| CallError::CallEnded)?;
        reply_rx.await.map_err(|_| CallError::CallEnded)?
    }

    /// Switch to the other camera without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error if the call ended, there is no outgoing video, or the
    /// other camera cannot be opened
    pub async fn switch_camera(&self) -> Result<FacingMode, CallError> {
        self.request(Command::SwitchCamera).await
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the call ended or holds no local stream
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMicrophone(enabled, reply)).await
    }

    /// Turn outgoing video on or off
    ///
    /// # Errors
    ///
    /// Returns error if the call ended or holds no local stream
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetCamera(enabled, reply)).await
    }

    /// Flip the microphone, returning the new state
    ///
    /// # Errors
    ///
    /// Returns error if the call ended or holds no local stream
    pub async fn toggle_microphone(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleMicrophone).await
    }

    /// Flip outgoing video, returning the new state
    ///
    /// # Errors
    ///
    /// Returns error if the call ended or holds no local stream
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleCamera).await
    }
}

enum Step {
    Command(Command),
    HandlesDropped,
    Input(NegotiationInput),
    InputsClosed,
    Unanswered,
}

struct CallSession {
    call_id: CallId,
    participants: CallParticipants,
    role: CallRole,
    config: CallConfig,
    deps: CallDependencies,
    media: MediaSession,
    negotiator: Option<Negotiator>,
    peer: Option<Arc<dyn PeerConnection>>,
    status: watch::Sender<CallStatus>,
    flag_set: bool,
    torn_down: bool,
}

impl CallSession {
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id, role = %self.role))]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let reason = match self.setup().await {
            Ok(()) => self.drive(&mut commands).await,
            Err(e) => {
                tracing::error!(error = %e, "Call setup failed");
                self.record_error(&e);
                EndReason::SetupFailed
            }
        };
        self.teardown(reason).await;
    }

    fn update_status(&self, f: impl FnOnce(&mut CallStatus)) {
        self.status.send_modify(|status| {
            f(status);
            status.updated_at = Utc::now();
        });
    }

    fn record_error(&self, error: &CallError) {
        let message = error.to_string();
        let negotiation = self.negotiation_state();
        self.update_status(|status| {
            status.last_error = Some(message);
            status.negotiation = negotiation;
        });
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.negotiator
            .as_ref()
            .map_or(NegotiationState::Idle, Negotiator::state)
    }

    async fn setup(&mut self) -> Result<(), CallError> {
        let ice_servers = resolve_ice_servers(self.deps.ice.as_ref(), &self.config.stun_fallback).await;
        tracing::debug!(count = ice_servers.len(), "Resolved ICE servers");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self.deps.peers.create(&ice_servers, events_tx).await?;
        self.peer = Some(peer.clone());

        let negotiator = self.negotiator.insert(Negotiator::new(
            self.call_id.clone(),
            self.role,
            peer,
            self.deps.signaling.clone(),
            events_rx,
        ));
        negotiator
            .start(&mut self.media)
            .await
            .map_err(|e| match e {
                NegotiationError::Media(e) => CallError::Media(e),
                other => CallError::Negotiation(other),
            })?;
        let negotiation = negotiator.state();

        self.update_status(|status| {
            status.phase = CallPhase::Active;
            status.negotiation = negotiation;
        });
        tracing::info!(?negotiation, "Call active");

        if let Some(flag) = &self.deps.active_flag {
            match flag.set_active(&self.call_id, true).await {
                Ok(()) => self.flag_set = true,
                Err(e) => tracing::warn!(error = %e, "Failed to set active call flag"),
            }
        }

        if self.role == CallRole::Caller {
            let notifier = self.deps.notifier.clone();
            let call_id = self.call_id.clone();
            let participants = self.participants.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify_incoming(&call_id, &participants).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Failed to notify callee");
                }
            });
        }
        Ok(())
    }

    async fn drive(&mut self, commands: &mut mpsc::Receiver<Command>) -> EndReason {
        let deadline = self.config.answer_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let Some(negotiator) = self.negotiator.as_mut() else {
                return EndReason::SetupFailed;
            };
            let awaiting_remote = !negotiator.state().has_remote_description();

            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::HandlesDropped,
                },
                input = negotiator.next_input() => match input {
                    Some(input) => Step::Input(input),
                    None => Step::InputsClosed,
                },
                () = sleep_until(deadline), if awaiting_remote => Step::Unanswered,
            };

            match step {
                Step::Command(Command::HangUp) => {
                    tracing::info!("Hang-up requested");
                    return EndReason::HangUp;
                }
                Step::Command(command) => self.handle_command(command).await,
                Step::HandlesDropped => {
                    tracing::info!("All call handles dropped, hanging up");
                    return EndReason::HangUp;
                }
                Step::Input(input) => {
                    let result = negotiator.handle(input, &mut self.media).await;
                    let negotiation = negotiator.state();
                    if self.status.borrow().negotiation != negotiation {
                        self.update_status(|status| status.negotiation = negotiation);
                    }
                    match result {
                        Ok(Progress::Continue) => {}
                        Ok(Progress::Terminated(ice_state)) => {
                            tracing::warn!(?ice_state, "Connection lost");
                            return EndReason::ConnectionLost(ice_state);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Negotiation failed");
                            self.record_error(&e.into());
                            return EndReason::NegotiationFailed;
                        }
                    }
                }
                Step::InputsClosed => {
                    tracing::warn!("Signaling and peer inputs closed");
                    return EndReason::NegotiationFailed;
                }
                Step::Unanswered => {
                    tracing::info!(timeout = ?self.config.answer_timeout, "Call unanswered");
                    return EndReason::Unanswered;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::HangUp => {}
            Command::SwitchCamera(reply) => {
                let result = match self.peer.clone() {
                    Some(peer) => self
                        .media
                        .switch_camera(peer.as_ref())
                        .await
                        .map_err(CallError::from),
                    None => Err(CallError::CallEnded),
                };
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Camera switch failed");
                }
                let _ = reply.send(result);
            }
            Command::SetMicrophone(enabled, reply) => {
                let _ = reply.send(self.media.set_microphone_enabled(enabled).map_err(Into::into));
            }
            Command::SetCamera(enabled, reply) => {
                let _ = reply.send(self.media.set_camera_enabled(enabled).map_err(Into::into));
            }
            Command::ToggleMicrophone(reply) => {
                let _ = reply.send(self.media.toggle_microphone().map_err(Into::into));
            }
            Command::ToggleCamera(reply) => {
                let _ = reply.send(self.media.toggle_camera().map_err(Into::into));
            }
        }
    }

    async fn teardown(&mut self, reason: EndReason) {
        if self.torn_down {
            tracing::debug!("Teardown already done");
            return;
        }
        self.torn_down = true;
        tracing::info!(?reason, "Tearing down call");

        let mut published = false;
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.cancel_subscriptions();
            negotiator.mark_closed();
            published = negotiator.has_published();
        }

        let stopped = self.media.stop_local();
        tracing::debug!(stopped, "Stopped local tracks");

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }

        if self.flag_set {
            if let Some(flag) = &self.deps.active_flag {
                if let Err(e) = flag.set_active(&self.call_id, false).await {
                    tracing::warn!(error = %e, "Failed to clear active call flag");
                }
            }
        }

        // Signaling data belongs to the other side until this side wrote
        // its offer or answer
        if published {
            if self.role == CallRole::Caller {
                if let Err(e) = self.deps.signaling.reset_call(&self.call_id).await {
                    tracing::warn!(error = %e, "Failed to remove call document");
                }
            }
            self.deps.signaling.purge_call(&self.call_id).await;
        } else {
            tracing::debug!("Nothing published, leaving signaling data in place");
        }

        let negotiation = self.negotiation_state();
        self.update_status(|status| {
            status.phase = CallPhase::TornDown;
            status.negotiation = negotiation;
            status.end_reason = Some(reason);
        });
        tracing::info!(?reason, "Call torn down");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
