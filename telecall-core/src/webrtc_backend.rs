//! Peer connections backed by the `webrtc` crate
//!
//! Each [`WebRtcPeerConnection`] registers its ICE candidate, track and ICE
//! state handlers once, at construction, and forwards them as [`PeerEvent`]s.
//! Local tracks become `TrackLocalStaticSample`s (Opus for audio, VP8 for
//! video); camera switches go through `RTCRtpSender::replace_track`.

use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    PeerEventSender, SenderId,
};
use crate::types::{IceCandidate, IceServer, SdpType, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opus frame signalling silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Opus frame duration
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Builds peer connections with default codecs and interceptors
pub struct WebRtcPeerConnectionFactory {
    api: API,
    silence_pump: bool,
}

impl WebRtcPeerConnectionFactory {
    /// Create a factory
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::ConfigError(format!("codec registration: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::ConfigError(format!("interceptor registration: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            silence_pump: false,
        })
    }

    /// Feed every attached audio track with Opus silence until it is
    /// stopped. For environments without a real capture pipeline.
    #[must_use]
    pub fn with_silence_pump(mut self) -> Self {
        self.silence_pump = true;
        self
    }
}

impl WebRtcPeerConnectionFactory {
    /// Build a peer connection with its event handlers registered
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be configured
    #[tracing::instrument(skip(self, ice_servers, events), fields(servers = ice_servers.len()))]
    pub async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<WebRtcPeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| PeerError::ConfigError(e.to_string()))?,
        );
        register_handlers(&pc, events);
        tracing::debug!("Created peer connection");

        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
            rtp_tracks: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
            silence_pump: self.silence_pump,
        }))
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc: Arc<dyn PeerConnection> = self.connect(ice_servers, events).await?;
        Ok(pc)
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: PeerEventSender) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidates.send(PeerEvent::IceCandidate(from_candidate_init(init)));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tracks = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let tracks = tracks.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => {
                        tracing::debug!("Ignoring remote track of unspecified kind");
                        return;
                    }
                };
                let _ = tracks.send(PeerEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
            })
        },
    ));

    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = events.send(PeerEvent::IceConnectionStateChange(ice_state(state)));
        Box::pin(async {})
    }));
}

fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| PeerError::Sdp(e.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::Sdp(format!("unexpected description type {other}"))),
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            channels: 0,
            ..Default::default()
        },
    }
}

/// Peer connection over `RTCPeerConnection`
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    /// Each sender with the id of the local track it currently carries
    senders: Mutex<HashMap<SenderId, (Arc<RTCRtpSender>, String)>>,
    rtp_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    next_sender: AtomicU64,
    silence_pump: bool,
}

impl WebRtcPeerConnection {
    /// RTP track backing a local track, for the capture pipeline to write
    /// samples into
    #[must_use]
    pub fn local_rtp_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtp_tracks.lock().get(track_id).cloned()
    }

    fn rtp_track_for(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        self.rtp_tracks
            .lock()
            .insert(track.id().to_string(), rtp.clone());
        if self.silence_pump && track.kind() == TrackKind::Audio {
            spawn_silence_pump(track.clone(), rtp.clone());
        }
        rtp
    }
}

fn spawn_silence_pump(track: LocalTrack, rtp: Arc<TrackLocalStaticSample>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME);
        while !track.is_stopped() {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: OPUS_FRAME,
                ..Default::default()
            };
            if let Err(e) = rtp.write_sample(&sample).await {
                tracing::debug!(track_id = %track.id(), error = %e, "Silence pump stopped");
                break;
            }
        }
    });
}

fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError> {
        let rtp = self.rtp_track_for(track);
        let sender = self
            .pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;
        spawn_rtcp_reader(sender.clone());

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders
            .lock()
            .insert(id, (sender, track.id().to_string()));
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), PeerError> {
        let (rtp_sender, _) = self
            .senders
            .lock()
            .get(&sender)
            .cloned()
            .ok_or(PeerError::SenderNotFound(sender))?;
        let rtp = self.rtp_track_for(track);
        if let Err(e) = rtp_sender
            .replace_track(Some(rtp as Arc<dyn TrackLocal + Send + Sync>))
            .await
        {
            self.rtp_tracks.lock().remove(track.id());
            return Err(PeerError::Track(e.to_string()));
        }

        let retired = self
            .senders
            .lock()
            .get_mut(&sender)
            .map(|(_, carried)| std::mem::replace(carried, track.id().to_string()))
            .filter(|retired| retired != track.id());
        if let Some(retired) = retired {
            self.rtp_tracks.lock().remove(&retired);
        }
        tracing::debug!(%sender, track_id = %track.id(), "Replaced outgoing track");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        self.rtp_tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|_| PeerError::Closed)
    }
}
