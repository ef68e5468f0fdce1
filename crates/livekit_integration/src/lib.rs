use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared::domain::{CallType, ConversationId, UserId};
use thiserror::Error;
use tokio::sync::broadcast;

const MAX_CHANNEL_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid channel name: {0}")]
    InvalidChannelName(&'static str),
    #[error("token encoding failed: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room_join: bool,
    room: String,
    can_publish: bool,
    can_subscribe: bool,
    can_publish_data: bool,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    sub: String,
    nbf: i64,
    exp: i64,
    iat: i64,
    video: VideoGrant,
    metadata: String,
}

/// Channel for a new call in a conversation. `nonce` keeps retries apart.
pub fn channel_name_for_call(conversation_id: ConversationId, nonce: &str) -> String {
    let nonce: String = nonce
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(32)
        .collect();
    format!("conv-{}-{}", conversation_id.0, nonce)
}

pub fn validate_channel_name(channel_name: &str) -> Result<(), TokenError> {
    if channel_name.is_empty() {
        return Err(TokenError::InvalidChannelName("must not be empty"));
    }
    if channel_name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(TokenError::InvalidChannelName("too long"));
    }
    if !channel_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
    {
        return Err(TokenError::InvalidChannelName(
            "only ascii letters, digits, '-', '_' and ':' are allowed",
        ));
    }
    Ok(())
}

/// Mints a room token whose identity is the user's numeric media uid.
pub fn mint_token(
    cfg: &LiveKitConfig,
    user_id: UserId,
    channel_name: &str,
    call_type: Option<CallType>,
) -> Result<String, TokenError> {
    validate_channel_name(channel_name)?;
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let metadata = serde_json::json!({
        "user_id": user_id.0,
        "call_type": call_type.map(CallType::as_str),
    });
    let claims = Claims {
        iss: cfg.api_key.clone(),
        sub: user_id.media_uid().to_string(),
        nbf: now.timestamp(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        video: VideoGrant {
            room_join: true,
            room: channel_name.to_string(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
        },
        metadata: metadata.to_string(),
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
    )?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveKitRoomOptions {
    pub room_name: String,
    pub token: String,
    pub media_uid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTrack {
    Microphone,
    Camera,
}

impl LocalTrack {
    pub fn for_call(call_type: CallType) -> &'static [LocalTrack] {
        match call_type {
            CallType::Audio => &[LocalTrack::Microphone],
            CallType::Video => &[LocalTrack::Microphone, LocalTrack::Camera],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveKitRoomEvent {
    TrackSubscribed { media_uid: u32, kind: TrackKind },
    TrackUnpublished { media_uid: u32, kind: TrackKind },
    ParticipantLeft { media_uid: u32 },
    Reconnected,
}

#[async_trait]
pub trait LiveKitRoomSession: Send + Sync {
    async fn publish_local_track(&self, track: LocalTrack) -> anyhow::Result<()>;
    async fn unpublish_local_tracks(&self) -> anyhow::Result<()>;
    async fn play_remote_audio(&self, media_uid: u32) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent>;
}

#[async_trait]
pub trait LiveKitRoomConnector: Send + Sync {
    async fn connect(&self, options: LiveKitRoomOptions)
        -> anyhow::Result<Arc<dyn LiveKitRoomSession>>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
