//! Synthetic capture devices for running calls without hardware

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use telecall_core::{CaptureConstraints, LocalTrack, MediaDevices, MediaError, TrackKind};

/// Devices that hand out placeholder tracks; media comes from the peer
/// connection's silence pump
#[derive(Default)]
pub struct SyntheticDevices {
    open: AtomicUsize,
}

impl SyntheticDevices {
    /// Tracks acquired and not yet stopped
    pub fn open_tracks(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
        stream_id: &str,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                format!("mic-{}", uuid::Uuid::new_v4()),
                stream_id,
                TrackKind::Audio,
                None,
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                format!("cam-{}", uuid::Uuid::new_v4()),
                stream_id,
                TrackKind::Video,
                Some(constraints.facing_mode),
            ));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceNotFound("no media kind requested".to_string()));
        }
        self.open.fetch_add(tracks.len(), Ordering::SeqCst);
        tracing::debug!(stream_id, count = tracks.len(), "Synthetic capture opened");
        Ok(tracks)
    }

    fn stop_track(&self, track: &LocalTrack) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(track_id = %track.id(), "Synthetic capture stopped");
    }
}
