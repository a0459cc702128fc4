// THEORY:
// The `LatestFrameBroadcaster` is the only state shared between a camera pipeline
// and its viewers. Each camera gets exactly one slot, created at startup and never
// removed, holding the most recently published frame and its version.
//
// Key architectural principles:
// 1.  **One slot, not a queue**: a slot is a `tokio::sync::watch` channel. Publishing
//     replaces the value; nothing older is retained. Memory per camera is one frame
//     no matter how many viewers are attached or how slow they are.
// 2.  **Version and bytes move together**: the version counter lives inside the
//     published value, and the value is swapped as a whole `Arc`. A reader can
//     never see a version paired with another frame's bytes.
// 3.  **The producer never waits**: `publish` is a pointer swap plus a wake-up. It
//     does not care whether anyone is listening.
// 4.  **Viewers skip, never lag**: a `ViewerSession` remembers the last version it
//     returned. `next` hands out whatever is newest, so a viewer that falls behind
//     jumps straight to the latest frame.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::CameraId;
use crate::core_modules::frame::AnnotatedFrame;
use crate::error::BroadcastError;

type Slot = watch::Sender<Option<Arc<PublishedFrame>>>;

/// A frame as stored in a slot: immutable, shared by every viewer that reads it.
#[derive(Debug)]
pub struct PublishedFrame {
    pub version: u64,
    pub frame: AnnotatedFrame,
}

#[derive(Clone)]
pub struct LatestFrameBroadcaster {
    slots: Arc<HashMap<CameraId, Slot>>,
}

impl LatestFrameBroadcaster {
    pub fn new(camera_ids: impl IntoIterator<Item = CameraId>) -> Self {
        let slots = camera_ids
            .into_iter()
            .map(|id| (id, watch::Sender::new(None)))
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    pub fn contains(&self, camera_id: CameraId) -> bool {
        self.slots.contains_key(&camera_id)
    }

    /// Configured camera ids in ascending order.
    pub fn camera_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn slot(&self, camera_id: CameraId) -> Result<&Slot, BroadcastError> {
        self.slots
            .get(&camera_id)
            .ok_or(BroadcastError::UnknownCamera(camera_id))
    }

    /// Replaces the camera's latest frame and returns the new version.
    pub fn publish(&self, camera_id: CameraId, frame: AnnotatedFrame) -> Result<u64, BroadcastError> {
        let slot = self.slot(camera_id)?;
        let sequence = frame.sequence;
        let mut version = 0;
        slot.send_modify(|latest| {
            version = latest.as_ref().map_or(0, |p| p.version) + 1;
            *latest = Some(Arc::new(PublishedFrame { version, frame }));
        });
        debug!(camera_id, version, sequence, viewers = slot.receiver_count(), "frame published");
        Ok(version)
    }

    pub fn subscribe(&self, camera_id: CameraId) -> Result<ViewerSession, BroadcastError> {
        let slot = self.slot(camera_id)?;
        let rx = slot.subscribe();
        info!(camera_id, viewers = slot.receiver_count(), "viewer attached");
        Ok(ViewerSession {
            camera_id,
            last_seen_version: 0,
            rx,
        })
    }

    /// Latest published frame without creating a session.
    pub fn latest(&self, camera_id: CameraId) -> Result<Option<Arc<PublishedFrame>>, BroadcastError> {
        Ok(self.slot(camera_id)?.borrow().clone())
    }

    pub fn viewer_count(&self, camera_id: CameraId) -> Result<usize, BroadcastError> {
        Ok(self.slot(camera_id)?.receiver_count())
    }
}

/// One viewer's position in one camera's frame sequence.
pub struct ViewerSession {
    camera_id: CameraId,
    last_seen_version: u64,
    rx: watch::Receiver<Option<Arc<PublishedFrame>>>,
}

impl ViewerSession {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn last_seen_version(&self) -> u64 {
        self.last_seen_version
    }

    /// Waits for a frame newer than the last one this session returned.
    ///
    /// Fails with `Closed` once the broadcaster is gone.
    pub async fn next(&mut self) -> Result<Arc<PublishedFrame>, BroadcastError> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(published) = current {
                if published.version > self.last_seen_version {
                    self.last_seen_version = published.version;
                    return Ok(published);
                }
            }
            self.rx
                .changed()
                .await
                .map_err(|_| BroadcastError::Closed(self.camera_id))?;
        }
    }

    /// The idempotent read: the newest frame, without advancing the session.
    /// Repeated calls with no publish in between return the same frame, while
    /// `next` blocks until something newer arrives.
    pub fn latest(&self) -> Option<Arc<PublishedFrame>> {
        self.rx.borrow().clone()
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        info!(
            camera_id = self.camera_id,
            last_version = self.last_seen_version,
            "viewer detached"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(sequence: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            jpeg: Bytes::from(sequence.to_be_bytes().to_vec()),
            sequence,
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn test_versions_increase_per_camera() {
        let broadcaster = LatestFrameBroadcaster::new([1, 2]);
        assert_eq!(broadcaster.publish(1, frame(0)).unwrap(), 1);
        assert_eq!(broadcaster.publish(1, frame(1)).unwrap(), 2);
        assert_eq!(broadcaster.publish(2, frame(0)).unwrap(), 1);
        assert_eq!(broadcaster.latest(1).unwrap().unwrap().frame.sequence, 1);
    }

    #[test]
    fn test_unknown_camera() {
        let broadcaster = LatestFrameBroadcaster::new([1]);
        assert_eq!(
            broadcaster.publish(9, frame(0)).unwrap_err(),
            BroadcastError::UnknownCamera(9)
        );
        assert!(matches!(broadcaster.subscribe(9), Err(BroadcastError::UnknownCamera(9))));
        assert_eq!(broadcaster.viewer_count(1).unwrap(), 0);
    }

    #[test]
    fn test_camera_ids_sorted() {
        let broadcaster = LatestFrameBroadcaster::new([4, 1, 3]);
        assert_eq!(broadcaster.camera_ids(), vec![1, 3, 4]);
        assert!(broadcaster.contains(3));
        assert!(!broadcaster.contains(2));
    }

    #[tokio::test]
    async fn test_next_returns_frame_published_before_subscribe() {
        let broadcaster = LatestFrameBroadcaster::new([1]);
        broadcaster.publish(1, frame(5)).unwrap();
        let mut session = broadcaster.subscribe(1).unwrap();
        let published = session.next().await.unwrap();
        assert_eq!(published.version, 1);
        assert_eq!(published.frame.sequence, 5);
    }

    #[tokio::test]
    async fn test_next_blocks_until_publish() {
        let broadcaster = LatestFrameBroadcaster::new([1]);
        let mut session = broadcaster.subscribe(1).unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), session.next()).await;
        assert!(pending.is_err());

        broadcaster.publish(1, frame(0)).unwrap();
        assert_eq!(session.next().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_session_counts_as_viewer_until_dropped() {
        let broadcaster = LatestFrameBroadcaster::new([1]);
        let session = broadcaster.subscribe(1).unwrap();
        assert_eq!(broadcaster.viewer_count(1).unwrap(), 1);
        drop(session);
        assert_eq!(broadcaster.viewer_count(1).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_when_broadcaster_dropped() {
        let broadcaster = LatestFrameBroadcaster::new([1]);
        let mut session = broadcaster.subscribe(1).unwrap();
        drop(broadcaster);
        assert_eq!(session.next().await.unwrap_err(), BroadcastError::Closed(1));
    }
}
