//! Media session management
//!
//! Owns the local capture stream and the remote stream of one call.
//!
//! # Ownership
//!
//! - The local stream is acquired once per call from [`MediaDevices`] and its
//!   tracks are attached to the peer connection. Every track is stopped exactly
//!   once, at teardown or when a camera switch retires it.
//! - The remote stream is created lazily on the first remote track and only
//!   grows afterwards; it is never replaced mid-call.
//!
//! Mute and video toggles flip the track's enabled flag. The capture pump is
//! expected to send silence or black frames for a disabled track, so no
//! renegotiation happens. A camera switch replaces the outgoing video track on
//! the existing sender.

use crate::peer::{PeerConnection, PeerError, SenderId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Capacity of the media event broadcast
const EVENT_CAPACITY: usize = 100;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Capture permission refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),

    /// No local stream has been acquired
    #[error("No local stream")]
    NoLocalStream,

    /// Peer connection rejected a track operation
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Camera facing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Back camera
    Environment,
}

impl FacingMode {
    /// The other camera
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
    /// Camera to open
    pub facing_mode: FacingMode,
    /// Requested video frame rate
    pub frame_rate: u32,
}

impl CaptureConstraints {
    /// Audio plus front camera at 30 fps
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            facing_mode: FacingMode::User,
            frame_rate: 30,
        }
    }

    /// Microphone only
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::video_call()
        }
    }

    fn camera_only(&self, facing_mode: FacingMode) -> Self {
        Self {
            audio: false,
            video: true,
            facing_mode,
            frame_rate: self.frame_rate,
        }
    }
}

#[derive(Debug)]
struct LocalTrackInner {
    id: String,
    stream_id: String,
    kind: TrackKind,
    facing_mode: Option<FacingMode>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Captured track; clones share the same enabled/stopped state
#[derive(Debug, Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    /// Describe a freshly captured, enabled track
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: TrackKind,
        facing_mode: Option<FacingMode>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalTrackInner {
                id: id.into(),
                stream_id: stream_id.into(),
                kind,
                facing_mode,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Identifier of the stream the track belongs to
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Camera direction, for video tracks
    pub fn facing_mode(&self) -> Option<FacingMode> {
        self.inner.facing_mode
    }

    /// Whether the track currently sends real media
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Mark the track stopped. Returns `true` only for the first call.
    pub fn mark_stopped(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::SeqCst)
    }
}

/// Remote track announced by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Remote stream identifier
    pub stream_id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Track as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Enabled flag (always true for remote tracks)
    pub enabled: bool,
}

/// Media stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Stream identifier
    pub id: String,
    /// Tracks in arrival order
    pub tracks: Vec<TrackInfo>,
}

/// Observable media state of a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSnapshot {
    /// Local stream, while held
    pub local: Option<MediaStream>,
    /// Remote stream, once the first remote track arrived
    pub remote: Option<MediaStream>,
    /// Camera currently in use
    pub facing_mode: FacingMode,
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Local capture started
    LocalStreamStarted {
        /// Stream identifier
        stream_id: String,
    },
    /// Local capture released
    LocalStreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// A track was added to the remote stream
    RemoteTrackAdded {
        /// The track
        track: RemoteTrack,
    },
    /// Microphone enabled or muted
    MicrophoneToggled {
        /// New state
        enabled: bool,
    },
    /// Camera enabled or disabled
    CameraToggled {
        /// New state
        enabled: bool,
    },
    /// Outgoing video switched camera
    CameraSwitched {
        /// Camera now in use
        facing_mode: FacingMode,
        /// Replacement track
        track_id: String,
    },
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open capture for the requested kinds, tagging tracks with `stream_id`
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
        stream_id: &str,
    ) -> Result<Vec<LocalTrack>, MediaError>;

    /// Release the device behind a track. Called once per track.
    fn stop_track(&self, track: &LocalTrack);
}

struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

/// Local and remote media of one call
pub struct MediaSession {
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    local: Option<LocalStream>,
    remote: Option<MediaStream>,
    video_sender: Option<SenderId>,
    events: broadcast::Sender<MediaEvent>,
    snapshot: watch::Sender<MediaSnapshot>,
}

impl MediaSession {
    /// Create a session; nothing is captured until [`MediaSession::acquire_local`]
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: CaptureConstraints) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(MediaSnapshot {
            facing_mode: constraints.facing_mode,
            ..MediaSnapshot::default()
        });
        Self {
            devices,
            constraints,
            local: None,
            remote: None,
            video_sender: None,
            events,
            snapshot,
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Broadcast sender for media events, for handles that outlive a borrow
    /// of the session
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<MediaEvent> {
        self.events.clone()
    }

    /// Watch the media snapshot
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<MediaSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current media snapshot
    #[must_use]
    pub fn snapshot(&self) -> MediaSnapshot {
        MediaSnapshot {
            local: self.local.as_ref().map(|stream| MediaStream {
                id: stream.id.clone(),
                tracks: stream
                    .tracks
                    .iter()
                    .map(|t| TrackInfo {
                        id: t.id().to_string(),
                        kind: t.kind(),
                        enabled: t.is_enabled(),
                    })
                    .collect(),
            }),
            remote: self.remote.clone(),
            facing_mode: self.constraints.facing_mode,
        }
    }

    /// Tracks of the local stream
    #[must_use]
    pub fn local_tracks(&self) -> &[LocalTrack] {
        self.local.as_ref().map_or(&[], |s| s.tracks.as_slice())
    }

    fn publish(&self, event: Option<MediaEvent>) {
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        self.snapshot.send_replace(self.snapshot());
    }

    /// Acquire local capture.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails or yields no track; the session then
    /// holds no local stream.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_local(&mut self) -> Result<(), MediaError> {
        if self.local.is_some() {
            return Ok(());
        }
        let stream_id = uuid::Uuid::new_v4().to_string();
        let tracks = self.devices.acquire(&self.constraints, &stream_id).await?;
        if tracks.is_empty() {
            return Err(MediaError::DeviceNotFound(
                "capture returned no tracks".to_string(),
            ));
        }
        tracing::info!(stream_id = %stream_id, tracks = tracks.len(), "Local stream acquired");
        self.local = Some(LocalStream {
            id: stream_id.clone(),
            tracks,
        });
        self.publish(Some(MediaEvent::LocalStreamStarted { stream_id }));
        Ok(())
    }

    /// Attach every local track to the peer connection
    ///
    /// # Errors
    ///
    /// Returns error if no local stream is held or a track is rejected
    pub async fn attach_to(&mut self, peer: &dyn PeerConnection) -> Result<(), MediaError> {
        let tracks = self
            .local
            .as_ref()
            .ok_or(MediaError::NoLocalStream)?
            .tracks
            .clone();
        for track in &tracks {
            let sender = peer.add_track(track).await?;
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), %sender, "Attached local track");
            if track.kind() == TrackKind::Video {
                self.video_sender = Some(sender);
            }
        }
        Ok(())
    }

    /// Append a remote track, creating the remote stream on first use
    pub fn add_remote_track(&mut self, track: RemoteTrack) {
        let stream = self.remote.get_or_insert_with(|| MediaStream {
            id: track.stream_id.clone(),
            tracks: Vec::new(),
        });
        if stream.tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        tracing::info!(track_id = %track.id, kind = ?track.kind, "Remote track added");
        stream.tracks.push(TrackInfo {
            id: track.id.clone(),
            kind: track.kind,
            enabled: true,
        });
        self.publish(Some(MediaEvent::RemoteTrackAdded { track }));
    }

    fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        let stream = self.local.as_ref().ok_or(MediaError::NoLocalStream)?;
        stream
            .tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .for_each(|t| t.set_enabled(enabled));
        Ok(())
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.local_tracks()
            .iter()
            .any(|t| t.kind() == kind && t.is_enabled())
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if no local stream is held
    pub fn set_microphone_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        self.set_kind_enabled(TrackKind::Audio, enabled)?;
        self.publish(Some(MediaEvent::MicrophoneToggled { enabled }));
        Ok(())
    }

    /// Turn outgoing video on or off
    ///
    /// # Errors
    ///
    /// Returns error if no local stream is held
    pub fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        self.set_kind_enabled(TrackKind::Video, enabled)?;
        self.publish(Some(MediaEvent::CameraToggled { enabled }));
        Ok(())
    }

    /// Flip the microphone, returning the new state
    ///
    /// # Errors
    ///
    /// Returns error if no local stream is held
    pub fn toggle_microphone(&mut self) -> Result<bool, MediaError> {
        let enabled = !self.kind_enabled(TrackKind::Audio);
        self.set_microphone_enabled(enabled)?;
        Ok(enabled)
    }

    /// Flip outgoing video, returning the new state
    ///
    /// # Errors
    ///
    /// Returns error if no local stream is held
    pub fn toggle_camera(&mut self) -> Result<bool, MediaError> {
        let enabled = !self.kind_enabled(TrackKind::Video);
        self.set_camera_enabled(enabled)?;
        Ok(enabled)
    }

    /// Switch to the opposite camera by replacing the outgoing video track
    /// on its existing sender.
    ///
    /// # Errors
    ///
    /// Returns error if there is no attached video track, the new camera
    /// cannot be opened, or the sender rejects the replacement
    #[tracing::instrument(skip(self, peer))]
    pub async fn switch_camera(&mut self, peer: &dyn PeerConnection) -> Result<FacingMode, MediaError> {
        let sender = self
            .video_sender
            .ok_or_else(|| MediaError::StreamError("no outgoing video sender".to_string()))?;
        let stream = self.local.as_ref().ok_or(MediaError::NoLocalStream)?;
        let position = stream
            .tracks
            .iter()
            .position(|t| t.kind() == TrackKind::Video)
            .ok_or_else(|| MediaError::StreamError("no local video track".to_string()))?;
        let old = stream.tracks[position].clone();
        let stream_id = stream.id.clone();
        let facing_mode = self.constraints.facing_mode.opposite();

        // The old track stays in the stream and on the sender until the
        // replacement is attached
        let mut acquired = self
            .devices
            .acquire(&self.constraints.camera_only(facing_mode), &stream_id)
            .await?;
        let Some(index) = acquired.iter().position(|t| t.kind() == TrackKind::Video) else {
            self.release(&acquired);
            return Err(MediaError::DeviceNotFound(format!("{facing_mode:?} camera")));
        };
        let replacement = acquired.swap_remove(index);
        self.release(&acquired);
        replacement.set_enabled(old.is_enabled());

        if let Err(e) = peer.replace_track(sender, &replacement).await {
            tracing::warn!(error = %e, track_id = %old.id(), "Track replacement rejected, keeping current camera");
            self.release(std::slice::from_ref(&replacement));
            return Err(e.into());
        }

        if let Some(stream) = self.local.as_mut() {
            stream.tracks[position] = replacement.clone();
        }
        self.release(std::slice::from_ref(&old));
        self.constraints.facing_mode = facing_mode;
        tracing::info!(?facing_mode, track_id = %replacement.id(), "Camera switched");
        self.publish(Some(MediaEvent::CameraSwitched {
            facing_mode,
            track_id: replacement.id().to_string(),
        }));
        Ok(facing_mode)
    }

    fn release(&self, tracks: &[LocalTrack]) {
        for track in tracks {
            if track.mark_stopped() {
                self.devices.stop_track(track);
            }
        }
    }

    /// Stop every local track and release the local stream.
    /// Returns how many tracks were stopped by this call.
    pub fn stop_local(&mut self) -> usize {
        let Some(stream) = self.local.take() else {
            return 0;
        };
        let mut stopped = 0;
        for track in &stream.tracks {
            if track.mark_stopped() {
                self.devices.stop_track(track);
                stopped += 1;
            }
        }
        self.video_sender = None;
        tracing::debug!(stream_id = %stream.id, stopped, "Local stream released");
        self.publish(Some(MediaEvent::LocalStreamStopped {
            stream_id: stream.id,
        }));
        stopped
    }
}
