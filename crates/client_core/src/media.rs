use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use livekit_integration::{
    LiveKitRoomConnector, LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, LocalTrack,
    TrackKind,
};
use shared::domain::CallType;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteTracks {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    RemoteTracksChanged { media_uid: u32, tracks: RemoteTracks },
    RemoteParticipantLeft { media_uid: u32 },
    Reconnected,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to join media room: {0}")]
    Join(String),
    #[error("failed to publish {track:?}: {message}")]
    Publish { track: LocalTrack, message: String },
    #[error("no media room joined")]
    NotJoined,
}

pub struct MissingLiveKitConnector;

#[async_trait]
impl LiveKitRoomConnector for MissingLiveKitConnector {
    async fn connect(
        &self,
        _options: LiveKitRoomOptions,
    ) -> anyhow::Result<Arc<dyn LiveKitRoomSession>> {
        Err(anyhow!("livekit connector is unavailable"))
    }
}

struct ActiveRoom {
    channel_name: String,
    room: Arc<dyn LiveKitRoomSession>,
    published: HashSet<LocalTrack>,
    event_task: JoinHandle<()>,
}

/// One LiveKit room at a time, driven by the call controller.
pub struct MediaSession {
    connector: Arc<dyn LiveKitRoomConnector>,
    active: Mutex<Option<ActiveRoom>>,
    remote: Arc<RwLock<HashMap<u32, RemoteTracks>>>,
    events: broadcast::Sender<MediaEvent>,
}

impl MediaSession {
    pub fn new(connector: Arc<dyn LiveKitRoomConnector>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connector,
            active: Mutex::new(None),
            remote: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Joins `channel_name`. Joining the room already held is a no-op.
    pub async fn join(
        &self,
        channel_name: &str,
        token: &str,
        media_uid: u32,
    ) -> Result<(), MediaError> {
        {
            let active = self.active.lock().await;
            if let Some(active) = active.as_ref() {
                if active.channel_name == channel_name {
                    debug!(channel = channel_name, "media: reusing joined room");
                    return Ok(());
                }
            }
        }
        // A different room is still held from an earlier call.
        self.leave().await?;

        let room = self
            .connector
            .connect(LiveKitRoomOptions {
                room_name: channel_name.to_string(),
                token: token.to_string(),
                media_uid,
            })
            .await
            .map_err(|err| MediaError::Join(err.to_string()))?;

        let event_task = self.spawn_room_event_task(Arc::clone(&room));
        self.remote.write().await.clear();

        let previous = self.active.lock().await.replace(ActiveRoom {
            channel_name: channel_name.to_string(),
            room,
            published: HashSet::new(),
            event_task,
        });
        if let Some(previous) = previous {
            previous.event_task.abort();
            let _ = previous.room.leave().await;
        }
        info!(channel = channel_name, media_uid, "media: joined room");
        Ok(())
    }

    /// Publishes the local tracks a call of `call_type` needs, skipping ones already live.
    pub async fn publish_local(&self, call_type: CallType) -> Result<(), MediaError> {
        let mut active = self.active.lock().await;
        let active = active.as_mut().ok_or(MediaError::NotJoined)?;
        for track in LocalTrack::for_call(call_type) {
            if active.published.contains(track) {
                continue;
            }
            active
                .room
                .publish_local_track(*track)
                .await
                .map_err(|err| MediaError::Publish {
                    track: *track,
                    message: err.to_string(),
                })?;
            active.published.insert(*track);
        }
        Ok(())
    }

    /// Releases local tracks and disconnects. Safe to call when not joined.
    pub async fn leave(&self) -> Result<(), MediaError> {
        let Some(active) = self.active.lock().await.take() else {
            return Ok(());
        };
        active.event_task.abort();
        if let Err(err) = active.room.unpublish_local_tracks().await {
            warn!(channel = %active.channel_name, %err, "media: unpublish failed");
        }
        if let Err(err) = active.room.leave().await {
            warn!(channel = %active.channel_name, %err, "media: leave failed");
        }
        self.remote.write().await.clear();
        info!(channel = %active.channel_name, "media: left room");
        Ok(())
    }

    pub async fn is_joined(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn published_tracks(&self) -> Vec<LocalTrack> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.published.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn remote_tracks(&self) -> HashMap<u32, RemoteTracks> {
        self.remote.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    fn spawn_room_event_task(&self, room: Arc<dyn LiveKitRoomSession>) -> JoinHandle<()> {
        let mut room_events = room.subscribe_events();
        let remote = Arc::clone(&self.remote);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(event) = room_events.recv().await {
                let media_event = match event {
                    LiveKitRoomEvent::TrackSubscribed { media_uid, kind } => {
                        if kind == TrackKind::Audio {
                            if let Err(err) = room.play_remote_audio(media_uid).await {
                                warn!(media_uid, %err, "media: remote audio autoplay failed");
                            }
                        }
                        let tracks = update_tracks(&remote, media_uid, kind, true).await;
                        MediaEvent::RemoteTracksChanged { media_uid, tracks }
                    }
                    LiveKitRoomEvent::TrackUnpublished { media_uid, kind } => {
                        let tracks = update_tracks(&remote, media_uid, kind, false).await;
                        MediaEvent::RemoteTracksChanged { media_uid, tracks }
                    }
                    LiveKitRoomEvent::ParticipantLeft { media_uid } => {
                        remote.write().await.remove(&media_uid);
                        MediaEvent::RemoteParticipantLeft { media_uid }
                    }
                    LiveKitRoomEvent::Reconnected => MediaEvent::Reconnected,
                };
                let _ = events.send(media_event);
            }
        })
    }
}

async fn update_tracks(
    remote: &RwLock<HashMap<u32, RemoteTracks>>,
    media_uid: u32,
    kind: TrackKind,
    live: bool,
) -> RemoteTracks {
    let mut remote = remote.write().await;
    let tracks = remote.entry(media_uid).or_default();
    match kind {
        TrackKind::Audio => tracks.audio = live,
        TrackKind::Video => tracks.video = live,
    }
    *tracks
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
