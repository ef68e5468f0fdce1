use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use livekit_integration::{
    LiveKitRoomConnector, LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, LocalTrack,
};
use shared::{
    domain::{
        CallId, CallStatus, CallType, ConversationId, DeclineReason, EndReason, ParticipantState,
        UserId,
    },
    error::ApiError,
    protocol::{
        CallParticipant, CallRecord, ClientSignal, InitiateCallRequest, MediaTokenResponse,
        ServerEvent,
    },
};
use tokio::sync::{broadcast, Notify};

use crate::{
    call::{MediaDevices, Ringer},
    orchestrator::{CallOrchestrator, OrchestratorError},
    transport::{SignalingTransport, TransportError},
};

pub struct FakeRoom {
    pub options: LiveKitRoomOptions,
    pub published: Mutex<Vec<LocalTrack>>,
    pub played: Mutex<Vec<u32>>,
    pub unpublished: AtomicUsize,
    pub left: AtomicUsize,
    pub events: broadcast::Sender<LiveKitRoomEvent>,
}

#[async_trait]
impl LiveKitRoomSession for FakeRoom {
    async fn publish_local_track(&self, track: LocalTrack) -> anyhow::Result<()> {
        self.published.lock().expect("lock").push(track);
        Ok(())
    }

    async fn unpublish_local_tracks(&self) -> anyhow::Result<()> {
        self.unpublished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play_remote_audio(&self, media_uid: u32) -> anyhow::Result<()> {
        self.played.lock().expect("lock").push(media_uid);
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.left.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub rooms: Mutex<Vec<Arc<FakeRoom>>>,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn room(&self, index: usize) -> Arc<FakeRoom> {
        Arc::clone(&self.rooms.lock().expect("lock")[index])
    }

    pub fn connects(&self) -> usize {
        self.rooms.lock().expect("lock").len()
    }
}

#[async_trait]
impl LiveKitRoomConnector for FakeConnector {
    async fn connect(
        &self,
        options: LiveKitRoomOptions,
    ) -> anyhow::Result<Arc<dyn LiveKitRoomSession>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sfu unreachable");
        }
        let (events, _) = broadcast::channel(64);
        let room = Arc::new(FakeRoom {
            options,
            published: Mutex::new(Vec::new()),
            played: Mutex::new(Vec::new()),
            unpublished: AtomicUsize::new(0),
            left: AtomicUsize::new(0),
            events,
        });
        self.rooms.lock().expect("lock").push(Arc::clone(&room));
        Ok(room)
    }
}

pub struct FakeTransport {
    pub sent: Mutex<Vec<ClientSignal>>,
    pub connected: AtomicBool,
    pub events: broadcast::Sender<ServerEvent>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            events,
        })
    }

    pub fn sent(&self) -> Vec<ClientSignal> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, signal: ClientSignal) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().expect("lock").push(signal);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// In-memory stand-in for the REST routes. Records every call as a short string.
pub struct FakeOrchestrator {
    pub log: Mutex<Vec<String>>,
    pub next_call_id: AtomicI64,
    pub fail_token: AtomicBool,
    pub initiated: Mutex<Vec<InitiateCallRequest>>,
    /// Record handed back by `answer` instead of the placeholder.
    pub answer_record: Mutex<Option<CallRecord>>,
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            next_call_id: AtomicI64::new(100),
            fail_token: AtomicBool::new(false),
            initiated: Mutex::new(Vec::new()),
            answer_record: Mutex::new(None),
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("lock").push(entry);
    }

    fn placeholder(&self, user_id: UserId, call_id: CallId) -> CallRecord {
        CallRecord {
            call_id,
            conversation_id: ConversationId(1),
            channel_name: "conv-1-test".to_string(),
            call_type: CallType::Audio,
            is_group: false,
            group_name: None,
            initiator_id: user_id,
            participants: Vec::new(),
            status: CallStatus::Ongoing,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
            initiator_left: false,
        }
    }
}

#[async_trait]
impl CallOrchestrator for FakeOrchestrator {
    async fn media_token(
        &self,
        user_id: UserId,
        channel_name: &str,
        _call_id: Option<CallId>,
    ) -> Result<MediaTokenResponse, OrchestratorError> {
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Rejected(ApiError::forbidden(
                "not a party to this call",
            )));
        }
        self.record(format!("token {}", user_id.0));
        Ok(MediaTokenResponse {
            channel_name: channel_name.to_string(),
            token: format!("tok-{}-{}", user_id.0, channel_name),
            media_uid: user_id.media_uid(),
        })
    }

    async fn initiate(
        &self,
        request: &InitiateCallRequest,
    ) -> Result<CallRecord, OrchestratorError> {
        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst));
        self.record(format!("initiate {}", call_id.0));
        self.initiated.lock().expect("lock").push(request.clone());
        Ok(CallRecord {
            call_id,
            conversation_id: request.conversation_id,
            channel_name: request.channel_name.clone(),
            call_type: request.call_type,
            is_group: request.is_group,
            group_name: request.group_name.clone(),
            initiator_id: request.user_id,
            participants: request
                .participant_ids
                .iter()
                .map(|user_id| CallParticipant {
                    user_id: *user_id,
                    state: ParticipantState::Pending,
                    answered_at: None,
                })
                .collect(),
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
            initiator_left: false,
        })
    }

    async fn answer(
        &self,
        user_id: UserId,
        call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        self.record(format!("answer {} {}", user_id.0, call_id.0));
        let preset = self.answer_record.lock().expect("lock").clone();
        Ok(preset.unwrap_or_else(|| self.placeholder(user_id, call_id)))
    }

    async fn decline(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: DeclineReason,
    ) -> Result<CallRecord, OrchestratorError> {
        self.record(format!("decline {} {} {:?}", user_id.0, call_id.0, reason));
        Ok(self.placeholder(user_id, call_id))
    }

    async fn end(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: EndReason,
    ) -> Result<CallRecord, OrchestratorError> {
        self.record(format!("end {} {} {}", user_id.0, call_id.0, reason.as_str()));
        Ok(self.placeholder(user_id, call_id))
    }

    async fn leave(
        &self,
        user_id: UserId,
        call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        self.record(format!("leave {} {}", user_id.0, call_id.0));
        Ok(self.placeholder(user_id, call_id))
    }
}

pub struct FakeDevices {
    pub deny: bool,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn ensure_permissions(&self, _call_type: CallType) -> Result<(), String> {
        if self.deny {
            Err("microphone blocked".to_string())
        } else {
            Ok(())
        }
    }
}

/// Holds `ensure_permissions` open until `release` is notified.
#[derive(Default)]
pub struct GatedDevices {
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl MediaDevices for GatedDevices {
    async fn ensure_permissions(&self, _call_type: CallType) -> Result<(), String> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRinger {
    pub sounds: Mutex<Vec<&'static str>>,
}

impl RecordingRinger {
    pub fn sounds(&self) -> Vec<&'static str> {
        self.sounds.lock().expect("lock").clone()
    }
}

impl Ringer for RecordingRinger {
    fn start_ringtone(&self) {
        self.sounds.lock().expect("lock").push("ringtone");
    }

    fn start_ringback(&self) {
        self.sounds.lock().expect("lock").push("ringback");
    }

    fn stop(&self) {
        self.sounds.lock().expect("lock").push("stop");
    }
}
