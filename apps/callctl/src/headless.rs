use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use livekit_integration::{
    LiveKitRoomConnector, LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, LocalTrack,
};
use tokio::sync::broadcast;
use tracing::info;

/// Media room stand-in for terminals: logs what a real room would do.
pub struct HeadlessConnector;

#[async_trait]
impl LiveKitRoomConnector for HeadlessConnector {
    async fn connect(&self, options: LiveKitRoomOptions) -> Result<Arc<dyn LiveKitRoomSession>> {
        info!(
            room = %options.room_name,
            media_uid = options.media_uid,
            "media: headless room joined"
        );
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(HeadlessRoom {
            room_name: options.room_name,
            events,
        }))
    }
}

struct HeadlessRoom {
    room_name: String,
    events: broadcast::Sender<LiveKitRoomEvent>,
}

#[async_trait]
impl LiveKitRoomSession for HeadlessRoom {
    async fn publish_local_track(&self, track: LocalTrack) -> Result<()> {
        info!(room = %self.room_name, ?track, "media: headless publish");
        Ok(())
    }

    async fn unpublish_local_tracks(&self) -> Result<()> {
        Ok(())
    }

    async fn play_remote_audio(&self, media_uid: u32) -> Result<()> {
        info!(room = %self.room_name, media_uid, "media: remote audio available");
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        info!(room = %self.room_name, "media: headless room left");
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent> {
        self.events.subscribe()
    }
}
