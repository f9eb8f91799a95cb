//! Recording test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telecall_core::{
    ActiveCallFlag, CallConfig, CallController, CallDependencies, CallId, CallParticipants,
    CalleeNotifier, CaptureConstraints, IceCandidate, IceServer, LocalTrack, MediaDevices,
    MediaError, MemoryStore, PeerConnection, PeerConnectionFactory, PeerError, PeerEventSender,
    SdpType, SenderId, SessionDescription, SignalingChannel, StaticIceServers, TrackKind,
};

/// One operation observed on a [`RecordingPeer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack { sender: SenderId, track_id: String },
    ReplaceTrack { sender: SenderId, track_id: String },
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Peer connection that records every call in order
#[derive(Default)]
pub struct RecordingPeer {
    calls: Mutex<Vec<PeerCall>>,
    next_sender: AtomicU64,
}

impl RecordingPeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&PeerCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }

    pub fn position(&self, matches: impl Fn(&PeerCall) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(|call| matches(call))
    }

    pub fn set_remote_count(&self) -> usize {
        self.count(|call| matches!(call, PeerCall::SetRemote(_)))
    }

    pub fn close_count(&self) -> usize {
        self.count(|call| *call == PeerCall::Close)
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for RecordingPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError> {
        let sender = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.record(PeerCall::AddTrack {
            sender,
            track_id: track.id().to_string(),
        });
        Ok(sender)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(PeerCall::ReplaceTrack {
            sender,
            track_id: track.id().to_string(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        // Yield so queued inputs get a chance to race the description
        tokio::task::yield_now().await;
        self.record(PeerCall::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(PeerCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

/// Factory handing out [`RecordingPeer`]s and keeping their event senders
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<(Arc<RecordingPeer>, PeerEventSender)>>,
    ice_servers: Mutex<Vec<Vec<IceServer>>>,
}

impl FakeFactory {
    pub fn peer(&self) -> Option<Arc<RecordingPeer>> {
        self.created.lock().last().map(|(peer, _)| peer.clone())
    }

    pub fn events(&self) -> Option<PeerEventSender> {
        self.created.lock().last().map(|(_, events)| events.clone())
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn ice_servers(&self) -> Vec<Vec<IceServer>> {
        self.ice_servers.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(RecordingPeer::default());
        self.created.lock().push((peer.clone(), events));
        self.ice_servers.lock().push(ice_servers.to_vec());
        Ok(peer)
    }
}

/// Capture devices that count acquisitions and stops
#[derive(Default)]
pub struct FakeDevices {
    acquisitions: Mutex<u32>,
    stopped: Mutex<Vec<String>>,
    pub deny: bool,
    /// Acquisitions that succeed before the device reports busy
    pub limit: Option<u32>,
}

impl FakeDevices {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn limited(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
        stream_id: &str,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied("camera and microphone".to_string()));
        }
        let n = {
            let mut acquisitions = self.acquisitions.lock();
            if self.limit.is_some_and(|limit| *acquisitions >= limit) {
                return Err(MediaError::DeviceNotFound("camera busy".to_string()));
            }
            *acquisitions += 1;
            *acquisitions
        };
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("audio-{n}"), stream_id, TrackKind::Audio, None));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                format!("video-{n}"),
                stream_id,
                TrackKind::Video,
                Some(constraints.facing_mode),
            ));
        }
        Ok(tracks)
    }

    fn stop_track(&self, track: &LocalTrack) {
        self.stopped.lock().push(track.id().to_string());
    }
}

/// Active-call flag that records every write
#[derive(Default)]
pub struct RecordingFlag {
    writes: Mutex<Vec<(CallId, bool)>>,
}

impl RecordingFlag {
    pub fn writes(&self) -> Vec<(CallId, bool)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl ActiveCallFlag for RecordingFlag {
    async fn set_active(&self, call_id: &CallId, active: bool) -> anyhow::Result<()> {
        self.writes.lock().push((call_id.clone(), active));
        Ok(())
    }
}

/// Notifier that records every notification
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<CallId>>,
}

impl RecordingNotifier {
    pub fn notified(&self) -> Vec<CallId> {
        self.notified.lock().clone()
    }
}

#[async_trait]
impl CalleeNotifier for RecordingNotifier {
    async fn notify_incoming(
        &self,
        call_id: &CallId,
        _participants: &CallParticipants,
    ) -> anyhow::Result<()> {
        self.notified.lock().push(call_id.clone());
        Ok(())
    }
}

/// One side of a call wired to fakes
pub struct Side {
    pub store: Arc<MemoryStore>,
    pub factory: Arc<FakeFactory>,
    pub devices: Arc<FakeDevices>,
    pub flag: Arc<RecordingFlag>,
    pub notifier: Arc<RecordingNotifier>,
    pub controller: CallController,
}

impl Side {
    pub fn new(store: Arc<MemoryStore>, config: CallConfig) -> Self {
        Self::with_devices(store, config, FakeDevices::default())
    }

    pub fn with_devices(store: Arc<MemoryStore>, config: CallConfig, devices: FakeDevices) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let devices = Arc::new(devices);
        let flag = Arc::new(RecordingFlag::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = CallDependencies::new(
            SignalingChannel::new(store.clone(), store.clone()),
            Arc::new(StaticIceServers::default()),
            factory.clone(),
            devices.clone(),
        )
        .with_active_flag(flag.clone())
        .with_notifier(notifier.clone());

        Self {
            store,
            factory,
            devices,
            flag,
            notifier,
            controller: CallController::new(deps, config),
        }
    }

    pub fn peer(&self) -> Arc<RecordingPeer> {
        self.factory.peer().unwrap()
    }
}

pub fn channel(store: &Arc<MemoryStore>) -> SignalingChannel {
    SignalingChannel::new(store.clone(), store.clone())
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
