use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use livekit_integration::channel_name_for_call;
use shared::{
    domain::{
        CallId, CallType, ConversationId, DeclineReason, EndReason, ParticipantState, UserId,
    },
    protocol::{CallRecord, CallerInfo, ClientSignal, InitiateCallRequest, ServerEvent},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    media::{MediaEvent, MediaSession},
    orchestrator::{CallOrchestrator, OrchestratorError},
    transport::{SignalingTransport, TransportError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Ringing,
    Ongoing,
    /// A call just finished and its notice is still on screen.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallNotice {
    Busy,
    Declined,
    Timeout,
    NoAnswer,
    PeerLeft,
    PermissionDenied,
    Missed,
    AnsweredElsewhere,
}

impl CallNotice {
    pub fn is_persistent(self) -> bool {
        matches!(self, CallNotice::PermissionDenied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("signaling connection lost")]
    ConnectionLost,
    #[error("could not set up call: {0}")]
    TokenError(String),
    #[error("camera or microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("peer is busy")]
    Busy,
    #[error("no answer")]
    NoAnswer,
    #[error("call timed out")]
    Timeout,
    #[error("call declined")]
    Declined,
    #[error("peer left the call")]
    PeerLeft,
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },
    #[error("media failure: {0}")]
    Media(String),
    #[error("server rejected signal: {0}")]
    Rejected(String),
    #[error("call was cancelled")]
    Cancelled,
}

impl From<TransportError> for CallError {
    fn from(_: TransportError) -> Self {
        CallError::ConnectionLost
    }
}

impl From<OrchestratorError> for CallError {
    fn from(value: OrchestratorError) -> Self {
        CallError::TokenError(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        state: CallState,
        call_id: Option<CallId>,
    },
    Notice {
        notice: CallNotice,
        persistent: bool,
    },
    NoticeCleared,
    DurationTick {
        seconds: u64,
    },
    ParticipantsChanged {
        call_id: CallId,
        participants: Vec<UserId>,
    },
    ParticipantDeclined {
        call_id: CallId,
        user_id: UserId,
        reason: DeclineReason,
    },
    Media(MediaEvent),
    Error(CallError),
}

#[derive(Debug, Clone)]
pub struct CallControllerConfig {
    pub declined_notice_delay: Duration,
    pub duration_tick: Duration,
}

impl Default for CallControllerConfig {
    fn default() -> Self {
        Self {
            declined_notice_delay: Duration::from_secs(2),
            duration_tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub picture: Option<String>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Err carries a human readable reason.
    async fn ensure_permissions(&self, call_type: CallType) -> Result<(), String>;
}

pub struct AllowAllDevices;

#[async_trait]
impl MediaDevices for AllowAllDevices {
    async fn ensure_permissions(&self, _call_type: CallType) -> Result<(), String> {
        Ok(())
    }
}

pub trait Ringer: Send + Sync {
    fn start_ringtone(&self);
    fn start_ringback(&self);
    fn stop(&self);
}

pub struct SilentRinger;

impl Ringer for SilentRinger {
    fn start_ringtone(&self) {}
    fn start_ringback(&self) {}
    fn stop(&self) {}
}

/// Descriptor pushed by the relay for a call addressed to us.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub from: CallerInfo,
    pub channel_name: String,
    pub call_type: CallType,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub call_id: Option<CallId>,
    pub conversation_id: Option<ConversationId>,
    pub channel_name: String,
    pub call_type: CallType,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub direction: CallDirection,
    pub caller: Option<CallerInfo>,
    pub initiator_id: UserId,
    /// Every party, initiator included.
    pub parties: Vec<UserId>,
    pub declined: Vec<UserId>,
    pub answered: Vec<UserId>,
    token: Option<String>,
    media_uid: u32,
}

impl ActiveCall {
    fn others(&self, me: UserId) -> Vec<UserId> {
        self.parties.iter().copied().filter(|id| *id != me).collect()
    }

    /// Other parties still in the call: the initiator unless they left,
    /// plus everyone who answered.
    fn connected_others(&self, me: UserId) -> Vec<UserId> {
        self.parties
            .iter()
            .copied()
            .filter(|id| *id != me && (*id == self.initiator_id || self.answered.contains(id)))
            .collect()
    }

    fn drop_party(&mut self, user_id: UserId) {
        self.parties.retain(|id| *id != user_id);
        self.answered.retain(|id| *id != user_id);
    }

    /// Folds in who the server saw answer, decline or leave before we joined.
    fn sync_with(&mut self, record: &CallRecord, me: UserId) {
        for participant in &record.participants {
            let user_id = participant.user_id;
            if user_id == me {
                continue;
            }
            match participant.state {
                ParticipantState::Answered => {
                    if !self.parties.contains(&user_id) {
                        self.parties.push(user_id);
                    }
                    if !self.answered.contains(&user_id) {
                        self.answered.push(user_id);
                    }
                }
                ParticipantState::Pending => {}
                _ => self.drop_party(user_id),
            }
        }
        if record.initiator_left && record.initiator_id != me {
            self.drop_party(record.initiator_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub generation: u64,
    pub call: Option<ActiveCall>,
}

struct Session {
    state: CallState,
    generation: u64,
    call: Option<ActiveCall>,
    ticker: Option<JoinHandle<()>>,
    dismiss: Option<JoinHandle<()>>,
}

impl Session {
    fn is_current(&self, generation: u64, call_id: CallId) -> bool {
        self.generation == generation
            && self.call.as_ref().and_then(|call| call.call_id) == Some(call_id)
    }

    fn stop_timers(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(dismiss) = self.dismiss.take() {
            dismiss.abort();
        }
    }
}

enum Finish {
    Immediate(Option<CallNotice>),
    Linger(CallNotice),
}

/// Drives one call at a time for the local user.
pub struct CallSessionController {
    identity: CallIdentity,
    config: CallControllerConfig,
    transport: Arc<dyn SignalingTransport>,
    orchestrator: Arc<dyn CallOrchestrator>,
    media: Arc<MediaSession>,
    devices: Arc<dyn MediaDevices>,
    ringer: Arc<dyn Ringer>,
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSessionController {
    pub fn new(
        identity: CallIdentity,
        transport: Arc<dyn SignalingTransport>,
        orchestrator: Arc<dyn CallOrchestrator>,
        media: Arc<MediaSession>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            identity,
            CallControllerConfig::default(),
            transport,
            orchestrator,
            media,
            Arc::new(AllowAllDevices),
            Arc::new(SilentRinger),
        )
    }

    pub fn new_with_dependencies(
        identity: CallIdentity,
        config: CallControllerConfig,
        transport: Arc<dyn SignalingTransport>,
        orchestrator: Arc<dyn CallOrchestrator>,
        media: Arc<MediaSession>,
        devices: Arc<dyn MediaDevices>,
        ringer: Arc<dyn Ringer>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            identity,
            config,
            transport,
            orchestrator,
            media,
            devices,
            ringer,
            session: Arc::new(Mutex::new(Session {
                state: CallState::Idle,
                generation: 0,
                call: None,
                ticker: None,
                dismiss: None,
            })),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub async fn state(&self) -> CallState {
        self.session.lock().await.state
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let session = self.session.lock().await;
        CallSnapshot {
            state: session.state,
            generation: session.generation,
            call: session.call.clone(),
        }
    }

    /// Maps a media room identity back to a party of the current call.
    pub async fn participant_for_media_uid(&self, media_uid: u32) -> Option<UserId> {
        let session = self.session.lock().await;
        session
            .call
            .as_ref()?
            .parties
            .iter()
            .copied()
            .find(|id| id.media_uid() == media_uid)
    }

    /// Feeds relay and media events into the controller until either stream closes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut signals = self.transport.subscribe();
        let mut media_events = self.media.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = signals.recv() => match event {
                        Ok(event) => this.handle_server_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "calls: signaling events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = media_events.recv() => match event {
                        Ok(event) => this.handle_media_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "calls: media events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    pub async fn initiate_call(
        &self,
        conversation_id: ConversationId,
        participants: Vec<UserId>,
        call_type: CallType,
        is_group: bool,
        group_name: Option<String>,
    ) -> Result<CallId, CallError> {
        let me = self.identity.user_id;
        self.ensure_idle("initiate").await?;
        if let Err(reason) = self.devices.ensure_permissions(call_type).await {
            self.notice(CallNotice::PermissionDenied);
            return Err(self.report(CallError::PermissionDenied(reason)));
        }
        if !self.transport.is_connected().await {
            return Err(self.report(CallError::ConnectionLost));
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let channel_name = channel_name_for_call(conversation_id, &nonce);
        let generation = {
            let mut session = self.session.lock().await;
            if session.state != CallState::Idle {
                return Err(self.report(CallError::InvalidState {
                    action: "initiate",
                    state: session.state,
                }));
            }

            let mut parties = vec![me];
            for id in &participants {
                if !parties.contains(id) {
                    parties.push(*id);
                }
            }
            session.generation += 1;
            session.call = Some(ActiveCall {
                call_id: None,
                conversation_id: Some(conversation_id),
                channel_name: channel_name.clone(),
                call_type,
                is_group,
                group_name: group_name.clone(),
                direction: CallDirection::Outgoing,
                caller: None,
                initiator_id: me,
                parties,
                declined: Vec::new(),
                answered: Vec::new(),
                token: None,
                media_uid: me.media_uid(),
            });
            self.set_state(&mut session, CallState::Connecting);
            session.generation
        };

        let token = match self
            .orchestrator
            .media_token(me, &channel_name, None)
            .await
        {
            Ok(token) => token,
            Err(err) => return Err(self.rollback(generation, err.into()).await),
        };
        let request = InitiateCallRequest {
            user_id: me,
            conversation_id,
            channel_name: channel_name.clone(),
            call_type,
            is_group,
            group_name: group_name.clone(),
            participant_ids: participants,
            idempotency_key: Some(Uuid::new_v4().to_string()),
        };
        let record = match self.orchestrator.initiate(&request).await {
            Ok(record) => record,
            Err(err) => return Err(self.rollback(generation, err.into()).await),
        };
        let call_id = record.call_id;

        {
            let mut session = self.session.lock().await;
            if session.generation != generation {
                drop(session);
                self.abandon(call_id, is_group, EndReason::Cancelled).await;
                return Err(CallError::Cancelled);
            }
            if let Some(call) = session.call.as_mut() {
                call.call_id = Some(call_id);
                call.token = Some(token.token.clone());
                call.media_uid = token.media_uid;
                call.parties = record.parties();
            }
        }

        let signal = ClientSignal::CallInitiate {
            call_id,
            channel_name: channel_name.clone(),
            call_type,
            is_group,
            group_name,
            target_user_ids: record.participant_ids(),
            caller_name: self.identity.display_name.clone(),
            caller_image: self.identity.picture.clone(),
        };
        if let Err(err) = self.transport.send(signal).await {
            let _ = self
                .orchestrator
                .end(me, call_id, EndReason::Failed)
                .await;
            return Err(self.rollback(generation, err.into()).await);
        }

        let mut session = self.session.lock().await;
        if !session.is_current(generation, call_id) {
            return Err(CallError::Cancelled);
        }
        // An answer can race the initiate signal back to us.
        if session.state == CallState::Connecting {
            self.set_state(&mut session, CallState::Ringing);
            self.ringer.start_ringback();
        }
        info!(call_id = call_id.0, user_id = me.0, is_group, "calls: outgoing call ringing");
        Ok(call_id)
    }

    pub async fn handle_incoming(&self, incoming: IncomingCall) {
        let mut session = self.session.lock().await;
        if session
            .call
            .as_ref()
            .is_some_and(|call| call.call_id == Some(incoming.call_id))
        {
            debug!(call_id = incoming.call_id.0, "calls: duplicate incoming call ignored");
            return;
        }
        if session.state != CallState::Idle {
            drop(session);
            info!(call_id = incoming.call_id.0, "calls: busy, auto-declining");
            let signal = ClientSignal::CallDecline {
                call_id: incoming.call_id,
                reason: DeclineReason::Busy,
            };
            if let Err(err) = self.transport.send(signal).await {
                warn!(call_id = incoming.call_id.0, %err, "calls: busy decline not sent");
            }
            return;
        }

        let mut parties = vec![incoming.from.user_id];
        for id in &incoming.participant_ids {
            if !parties.contains(id) {
                parties.push(*id);
            }
        }
        session.stop_timers();
        session.generation += 1;
        session.call = Some(ActiveCall {
            call_id: Some(incoming.call_id),
            conversation_id: None,
            channel_name: incoming.channel_name,
            call_type: incoming.call_type,
            is_group: incoming.is_group,
            group_name: incoming.group_name,
            direction: CallDirection::Incoming,
            initiator_id: incoming.from.user_id,
            caller: Some(incoming.from),
            parties,
            declined: Vec::new(),
            answered: Vec::new(),
            token: None,
            media_uid: self.identity.user_id.media_uid(),
        });
        self.set_state(&mut session, CallState::Ringing);
        self.ringer.start_ringtone();
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        let me = self.identity.user_id;
        let (generation, call) = {
            let mut session = self.session.lock().await;
            let call = match session.call.clone() {
                Some(call)
                    if session.state == CallState::Ringing
                        && call.direction == CallDirection::Incoming =>
                {
                    call
                }
                _ => {
                    return Err(self.report(CallError::InvalidState {
                        action: "accept",
                        state: session.state,
                    }))
                }
            };
            if let Err(reason) = self.devices.ensure_permissions(call.call_type).await {
                self.ringer.stop();
                self.teardown(&mut session);
                drop(session);
                self.notice(CallNotice::PermissionDenied);
                if let Some(call_id) = call.call_id {
                    self.decline_quietly(call_id, DeclineReason::Declined).await;
                }
                return Err(self.report(CallError::PermissionDenied(reason)));
            }
            self.ringer.stop();
            self.set_state(&mut session, CallState::Connecting);
            (session.generation, call)
        };
        let Some(call_id) = call.call_id else {
            return Err(self.rollback(generation, CallError::Cancelled).await);
        };

        let token = match self
            .orchestrator
            .media_token(me, &call.channel_name, Some(call_id))
            .await
        {
            Ok(token) => token,
            Err(err) => return Err(self.rollback(generation, err.into()).await),
        };
        let record = match self.orchestrator.answer(me, call_id).await {
            Ok(record) => record,
            Err(err) => return Err(self.rollback(generation, err.into()).await),
        };
        let signal = ClientSignal::CallAnswer {
            call_id,
            channel_name: call.channel_name.clone(),
        };
        if let Err(err) = self.transport.send(signal).await {
            return Err(self.rollback(generation, err.into()).await);
        }
        if let Err(err) = self
            .join_media(&call.channel_name, &token.token, token.media_uid, call.call_type)
            .await
        {
            self.abandon(call_id, call.is_group, EndReason::Failed).await;
            return Err(self.rollback(generation, err).await);
        }

        let mut session = self.session.lock().await;
        if !session.is_current(generation, call_id) {
            drop(session);
            let _ = self.media.leave().await;
            return Err(CallError::Cancelled);
        }
        if let Some(active) = session.call.as_mut() {
            active.token = Some(token.token);
            active.media_uid = token.media_uid;
            active.sync_with(&record, me);
            if !active.answered.contains(&me) {
                active.answered.push(me);
            }
        }
        self.go_ongoing(&mut session);
        info!(call_id = call_id.0, user_id = me.0, "calls: answered");
        Ok(())
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        let call_id = {
            let mut session = self.session.lock().await;
            let call_id = match session.call.as_ref() {
                Some(call)
                    if session.state == CallState::Ringing
                        && call.direction == CallDirection::Incoming =>
                {
                    call.call_id
                }
                _ => {
                    return Err(self.report(CallError::InvalidState {
                        action: "reject",
                        state: session.state,
                    }))
                }
            };
            self.ringer.stop();
            self.teardown(&mut session);
            call_id
        };
        let Some(call_id) = call_id else {
            return Ok(());
        };
        if let Err(err) = self
            .orchestrator
            .decline(self.identity.user_id, call_id, DeclineReason::Declined)
            .await
        {
            warn!(call_id = call_id.0, %err, "calls: decline not persisted");
        }
        let signal = ClientSignal::CallDecline {
            call_id,
            reason: DeclineReason::Declined,
        };
        self.transport
            .send(signal)
            .await
            .map_err(|err| self.report(err.into()))?;
        info!(call_id = call_id.0, "calls: declined");
        Ok(())
    }

    /// Hangs up whatever is active. Calling it with nothing active does nothing.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call, previous) = {
            let mut session = self.session.lock().await;
            let state = session.state;
            match state {
                CallState::Idle => return Ok(()),
                CallState::Ended => {
                    self.teardown(&mut session);
                    self.emit(CallEvent::NoticeCleared);
                    return Ok(());
                }
                CallState::Ringing
                    if session
                        .call
                        .as_ref()
                        .is_some_and(|call| call.direction == CallDirection::Incoming) =>
                {
                    drop(session);
                    return self.reject_call().await;
                }
                state => {
                    self.ringer.stop();
                    let call = session.call.clone();
                    self.teardown(&mut session);
                    (call, state)
                }
            }
        };
        if let Err(err) = self.media.leave().await {
            warn!(%err, "calls: media leave failed");
        }
        let Some(call) = call else {
            return Ok(());
        };
        let Some(call_id) = call.call_id else {
            // Still connecting; initiate notices the bumped generation.
            return Ok(());
        };

        let me = self.identity.user_id;
        let signal = if call.is_group {
            if let Err(err) = self.orchestrator.leave(me, call_id).await {
                warn!(call_id = call_id.0, %err, "calls: leave not persisted");
            }
            ClientSignal::CallLeave { call_id }
        } else {
            let reason = if previous == CallState::Ongoing {
                EndReason::Hangup
            } else {
                EndReason::Cancelled
            };
            if let Err(err) = self.orchestrator.end(me, call_id, reason).await {
                warn!(call_id = call_id.0, %err, "calls: end not persisted");
            }
            ClientSignal::CallEnd { call_id, reason }
        };
        self.transport
            .send(signal)
            .await
            .map_err(|err| self.report(err.into()))?;
        info!(call_id = call_id.0, "calls: hung up");
        Ok(())
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        let me = self.identity.user_id;
        match event {
            ServerEvent::CallIncoming {
                call_id,
                from,
                channel_name,
                call_type,
                is_group,
                group_name,
                participant_ids,
            } => {
                self.handle_incoming(IncomingCall {
                    call_id,
                    from,
                    channel_name,
                    call_type,
                    is_group,
                    group_name,
                    participant_ids,
                })
                .await;
            }
            ServerEvent::CallAnswered {
                call_id, user_id, ..
            } => self.on_answered(call_id, user_id).await,
            ServerEvent::CallDeclined {
                call_id,
                user_id,
                reason,
            } => self.on_declined(call_id, user_id, reason).await,
            ServerEvent::CallTimeout { call_id } => {
                let Some((generation, direction, state)) = self.current(call_id).await else {
                    return;
                };
                match (direction, state) {
                    (CallDirection::Outgoing, CallState::Connecting | CallState::Ringing) => {
                        self.finish(generation, call_id, Finish::Linger(CallNotice::Timeout))
                            .await;
                    }
                    (CallDirection::Incoming, CallState::Ringing | CallState::Connecting) => {
                        self.finish(
                            generation,
                            call_id,
                            Finish::Immediate(Some(CallNotice::Missed)),
                        )
                        .await;
                    }
                    _ => {}
                }
            }
            ServerEvent::CallMissed { call_id } => {
                let Some((generation, direction, _)) = self.current(call_id).await else {
                    return;
                };
                let notice = match direction {
                    CallDirection::Incoming => CallNotice::Missed,
                    CallDirection::Outgoing => CallNotice::NoAnswer,
                };
                self.finish(generation, call_id, Finish::Immediate(Some(notice)))
                    .await;
            }
            ServerEvent::CallEnded { call_id, reason } => {
                let Some((generation, _, _)) = self.current(call_id).await else {
                    return;
                };
                debug!(call_id = call_id.0, reason = reason.as_str(), "calls: ended remotely");
                self.finish(generation, call_id, Finish::Immediate(None)).await;
            }
            ServerEvent::ParticipantLeft { call_id, user_id } if user_id != me => {
                self.on_participant_left(call_id, user_id).await;
            }
            ServerEvent::Error(error) => {
                self.report(CallError::Rejected(error.message));
            }
            _ => {}
        }
    }

    async fn handle_media_event(&self, event: MediaEvent) {
        if event == MediaEvent::Reconnected {
            let call_type = {
                let session = self.session.lock().await;
                match (&session.call, session.state) {
                    (Some(call), CallState::Ongoing) => Some(call.call_type),
                    _ => None,
                }
            };
            if let Some(call_type) = call_type {
                if let Err(err) = self.media.publish_local(call_type).await {
                    self.report(CallError::Media(err.to_string()));
                }
            }
        }
        self.emit(CallEvent::Media(event));
    }

    async fn on_answered(&self, call_id: CallId, user_id: UserId) {
        let me = self.identity.user_id;
        let (generation, call, state) = {
            let mut session = self.session.lock().await;
            let generation = session.generation;
            let state = session.state;
            let Some(call) = session.call.as_mut() else {
                return;
            };
            if call.call_id != Some(call_id) {
                return;
            }
            if user_id == me {
                // One of our other devices picked up.
                if call.direction == CallDirection::Incoming && state == CallState::Ringing {
                    drop(session);
                    self.finish(
                        generation,
                        call_id,
                        Finish::Immediate(Some(CallNotice::AnsweredElsewhere)),
                    )
                    .await;
                }
                return;
            }
            if !call.answered.contains(&user_id) {
                call.answered.push(user_id);
            }
            if !call.parties.contains(&user_id) {
                call.parties.push(user_id);
            }
            call.declined.retain(|id| *id != user_id);
            let call = call.clone();
            self.emit(CallEvent::ParticipantsChanged {
                call_id,
                participants: call.answered.clone(),
            });
            (generation, call, state)
        };

        let waiting = call.direction == CallDirection::Outgoing
            && matches!(state, CallState::Connecting | CallState::Ringing);
        if !waiting {
            return;
        }
        self.ringer.stop();
        let Some(token) = call.token.clone() else {
            return;
        };
        if let Err(err) = self
            .join_media(&call.channel_name, &token, call.media_uid, call.call_type)
            .await
        {
            self.abandon(call_id, call.is_group, EndReason::Failed).await;
            self.rollback(generation, err).await;
            return;
        }
        let mut session = self.session.lock().await;
        if !session.is_current(generation, call_id) {
            drop(session);
            let _ = self.media.leave().await;
            return;
        }
        if session.state != CallState::Ongoing {
            self.go_ongoing(&mut session);
            info!(call_id = call_id.0, answered_by = user_id.0, "calls: connected");
        }
    }

    async fn on_declined(&self, call_id: CallId, user_id: UserId, reason: DeclineReason) {
        let me = self.identity.user_id;
        let (generation, finish) = {
            let mut session = self.session.lock().await;
            let generation = session.generation;
            let state = session.state;
            let Some(call) = session.call.as_mut() else {
                return;
            };
            if call.call_id != Some(call_id) {
                return;
            }
            if user_id == me {
                if call.direction == CallDirection::Incoming && state == CallState::Ringing {
                    (generation, Some(Finish::Immediate(None)))
                } else {
                    return;
                }
            } else {
                if call.declined.contains(&user_id) {
                    return;
                }
                call.declined.push(user_id);
                call.drop_party(user_id);
                self.emit(CallEvent::ParticipantDeclined {
                    call_id,
                    user_id,
                    reason,
                });
                if call.direction == CallDirection::Incoming {
                    return;
                }
                let notice = match reason {
                    DeclineReason::Busy => CallNotice::Busy,
                    DeclineReason::Declined => CallNotice::Declined,
                };
                let everyone_declined = call.others(me).is_empty();
                let still_waiting = matches!(state, CallState::Connecting | CallState::Ringing);
                if still_waiting && (!call.is_group || everyone_declined) {
                    (generation, Some(Finish::Linger(notice)))
                } else {
                    return;
                }
            }
        };
        if let Some(finish) = finish {
            self.finish(generation, call_id, finish).await;
        }
    }

    async fn on_participant_left(&self, call_id: CallId, user_id: UserId) {
        let me = self.identity.user_id;
        let (generation, is_group, alone) = {
            let mut session = self.session.lock().await;
            let generation = session.generation;
            let ongoing = session.state == CallState::Ongoing;
            let Some(call) = session.call.as_mut() else {
                return;
            };
            if call.call_id != Some(call_id) {
                return;
            }
            call.drop_party(user_id);
            let participants = call.answered.clone();
            let is_group = call.is_group;
            let alone = ongoing && call.connected_others(me).is_empty();
            self.emit(CallEvent::ParticipantsChanged {
                call_id,
                participants,
            });
            (generation, is_group, alone)
        };
        if !is_group {
            self.finish(generation, call_id, Finish::Immediate(Some(CallNotice::PeerLeft)))
                .await;
        } else if alone {
            if self
                .finish(generation, call_id, Finish::Immediate(Some(CallNotice::PeerLeft)))
                .await
            {
                self.abandon(call_id, true, EndReason::Hangup).await;
            }
        }
    }

    async fn ensure_idle(&self, action: &'static str) -> Result<(), CallError> {
        let state = self.session.lock().await.state;
        if state == CallState::Idle {
            Ok(())
        } else {
            Err(self.report(CallError::InvalidState { action, state }))
        }
    }

    async fn current(&self, call_id: CallId) -> Option<(u64, CallDirection, CallState)> {
        let session = self.session.lock().await;
        let call = session.call.as_ref()?;
        (call.call_id == Some(call_id) && session.state != CallState::Idle)
            .then_some((session.generation, call.direction, session.state))
    }

    /// Compare-and-set terminal transition. False when the call already moved on.
    async fn finish(&self, generation: u64, call_id: CallId, finish: Finish) -> bool {
        {
            let mut session = self.session.lock().await;
            if !session.is_current(generation, call_id) || session.state == CallState::Ended {
                debug!(call_id = call_id.0, "calls: stale terminal signal discarded");
                return false;
            }
            self.ringer.stop();
            match finish {
                Finish::Immediate(notice) => {
                    self.teardown(&mut session);
                    if let Some(notice) = notice {
                        self.notice(notice);
                    }
                }
                Finish::Linger(notice) => {
                    session.stop_timers();
                    session.generation += 1;
                    self.set_state(&mut session, CallState::Ended);
                    self.notice(notice);
                    session.dismiss = Some(self.spawn_dismiss(session.generation));
                }
            }
        }
        if let Err(err) = self.media.leave().await {
            warn!(call_id = call_id.0, %err, "calls: media leave failed");
        }
        info!(call_id = call_id.0, "calls: call finished");
        true
    }

    /// Back to idle after a failure, unless something else already took over.
    async fn rollback(&self, generation: u64, error: CallError) -> CallError {
        let mut session = self.session.lock().await;
        if session.generation == generation {
            self.ringer.stop();
            self.teardown(&mut session);
            drop(session);
            if let Err(err) = self.media.leave().await {
                warn!(%err, "calls: media leave failed");
            }
        }
        self.report(error)
    }

    async fn join_media(
        &self,
        channel_name: &str,
        token: &str,
        media_uid: u32,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.media
            .join(channel_name, token, media_uid)
            .await
            .map_err(|err| CallError::Media(err.to_string()))?;
        self.media
            .publish_local(call_type)
            .await
            .map_err(|err| CallError::Media(err.to_string()))
    }

    /// Best-effort hangup for a call we are walking away from.
    async fn abandon(&self, call_id: CallId, is_group: bool, reason: EndReason) {
        let me = self.identity.user_id;
        let signal = if is_group {
            let _ = self.orchestrator.leave(me, call_id).await;
            ClientSignal::CallLeave { call_id }
        } else {
            let _ = self.orchestrator.end(me, call_id, reason).await;
            ClientSignal::CallEnd { call_id, reason }
        };
        if let Err(err) = self.transport.send(signal).await {
            warn!(call_id = call_id.0, %err, "calls: hangup signal not sent");
        }
    }

    async fn decline_quietly(&self, call_id: CallId, reason: DeclineReason) {
        let _ = self
            .orchestrator
            .decline(self.identity.user_id, call_id, reason)
            .await;
        if let Err(err) = self
            .transport
            .send(ClientSignal::CallDecline { call_id, reason })
            .await
        {
            warn!(call_id = call_id.0, %err, "calls: decline signal not sent");
        }
    }

    fn go_ongoing(&self, session: &mut Session) {
        self.ringer.stop();
        self.set_state(session, CallState::Ongoing);
        if let Some(ticker) = session.ticker.take() {
            ticker.abort();
        }
        session.ticker = Some(self.spawn_ticker());
    }

    fn teardown(&self, session: &mut Session) {
        session.stop_timers();
        session.generation += 1;
        session.call = None;
        self.set_state(session, CallState::Idle);
    }

    fn set_state(&self, session: &mut Session, state: CallState) {
        if session.state == state {
            return;
        }
        session.state = state;
        self.emit(CallEvent::StateChanged {
            state,
            call_id: session.call.as_ref().and_then(|call| call.call_id),
        });
    }

    fn spawn_ticker(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let period = self.config.duration_tick;
        let started = Instant::now();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(started + period, period);
            loop {
                interval.tick().await;
                let _ = events.send(CallEvent::DurationTick {
                    seconds: started.elapsed().as_secs(),
                });
            }
        })
    }

    fn spawn_dismiss(&self, generation: u64) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        let delay = self.config.declined_notice_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut session = session.lock().await;
            if session.generation != generation || session.state != CallState::Ended {
                return;
            }
            session.generation += 1;
            session.call = None;
            session.state = CallState::Idle;
            session.dismiss = None;
            let _ = events.send(CallEvent::NoticeCleared);
            let _ = events.send(CallEvent::StateChanged {
                state: CallState::Idle,
                call_id: None,
            });
        })
    }

    fn notice(&self, notice: CallNotice) {
        self.emit(CallEvent::Notice {
            notice,
            persistent: notice.is_persistent(),
        });
    }

    fn report(&self, error: CallError) -> CallError {
        warn!(%error, "calls: operation failed");
        self.emit(CallEvent::Error(error.clone()));
        error
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
