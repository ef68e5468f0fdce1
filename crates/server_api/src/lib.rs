use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use livekit_integration::{mint_token, validate_channel_name, LiveKitConfig, TokenError};
use shared::{
    domain::{
        CallId, CallStatus, ConversationId, DeclineReason, EndReason, ParticipantState, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{CallRecord, InitiateCallRequest, MediaTokenRequest, MediaTokenResponse},
};
use storage::{NewCall, Storage};
use tokio::sync::Mutex;
use tracing::{debug, info};

const MAX_USERNAME_LEN: usize = 64;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_GROUP_PARTICIPANTS: usize = 32;

#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// How long a repeated idempotency key folds into the original call.
    pub initiate_dedup_window: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            initiate_dedup_window: Duration::seconds(10),
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub livekit: LiveKitConfig,
    pub policy: CallPolicy,
    /// Serializes read-modify-write cycles on call records.
    call_mutations: Arc<Mutex<()>>,
}

impl ApiContext {
    pub fn new(storage: Storage, livekit: LiveKitConfig, policy: CallPolicy) -> Self {
        Self {
            storage,
            livekit,
            policy,
            call_mutations: Arc::new(Mutex::new(())),
        }
    }
}

/// Result of a ring timeout firing.
#[derive(Debug, Clone)]
pub struct ExpiredCall {
    pub record: CallRecord,
    /// Participants that were still pending and are now missed.
    pub newly_missed: Vec<UserId>,
    /// True when the whole call went from ringing to missed.
    pub expired: bool,
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(ApiError::validation(format!(
            "username must be 1..={MAX_USERNAME_LEN} bytes"
        )));
    }
    ctx.storage.create_user(username).await.map_err(internal)
}

pub async fn issue_media_token(
    ctx: &ApiContext,
    request: &MediaTokenRequest,
) -> Result<MediaTokenResponse, ApiError> {
    let call_type = match request.call_id {
        Some(call_id) => {
            let record = load_call(ctx, call_id).await?;
            if !record.is_party(request.user_id) {
                return Err(ApiError::forbidden("user is not part of this call"));
            }
            if record.channel_name != request.channel_name {
                return Err(ApiError::validation("channel does not belong to call"));
            }
            if record.status.is_terminal() {
                return Err(ApiError::conflict("call is no longer active"));
            }
            Some(record.call_type)
        }
        None => None,
    };

    let token = mint_token(&ctx.livekit, request.user_id, &request.channel_name, call_type)
        .map_err(token_error)?;
    debug!(
        user_id = request.user_id.0,
        channel = %request.channel_name,
        "calls: media token issued"
    );
    Ok(MediaTokenResponse {
        channel_name: request.channel_name.clone(),
        token,
        media_uid: request.user_id.media_uid(),
    })
}

pub async fn initiate_call(
    ctx: &ApiContext,
    request: &InitiateCallRequest,
) -> Result<CallRecord, ApiError> {
    let initiator = request.user_id;
    let participant_ids = normalize_participants(initiator, &request.participant_ids)?;
    if !request.is_group && participant_ids.len() != 1 {
        return Err(ApiError::validation(
            "a one-to-one call needs exactly one participant",
        ));
    }
    if participant_ids.len() > MAX_GROUP_PARTICIPANTS {
        return Err(ApiError::validation(format!(
            "a call supports at most {MAX_GROUP_PARTICIPANTS} participants"
        )));
    }
    validate_channel_name(&request.channel_name).map_err(token_error)?;
    let idempotency_key = match request.idempotency_key.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(key) if key.len() > MAX_IDEMPOTENCY_KEY_LEN => {
            return Err(ApiError::validation("idempotency key is too long"));
        }
        Some(key) => Some(key.to_string()),
    };

    let _guard = ctx.call_mutations.lock().await;
    let now = Utc::now();
    if let Some(key) = idempotency_key.as_deref() {
        if let Some(existing) = ctx
            .storage
            .find_call_by_idempotency_key(initiator, key)
            .await
            .map_err(internal)?
        {
            if now - existing.created_at > ctx.policy.initiate_dedup_window {
                return Err(ApiError::conflict("idempotency key was already used"));
            }
            info!(
                call_id = existing.call_id.0,
                initiator = initiator.0,
                "calls: duplicate initiate folded into existing call"
            );
            return load_call(ctx, existing.call_id).await;
        }
    }

    let call_id = ctx
        .storage
        .insert_call(&NewCall {
            conversation_id: request.conversation_id,
            channel_name: request.channel_name.clone(),
            call_type: request.call_type,
            is_group: request.is_group,
            group_name: request
                .group_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            initiator_id: initiator,
            participant_ids,
            idempotency_key,
            created_at: now,
        })
        .await
        .map_err(internal)?;
    info!(
        call_id = call_id.0,
        initiator = initiator.0,
        conversation_id = request.conversation_id.0,
        call_type = request.call_type.as_str(),
        is_group = request.is_group,
        "calls: initiated"
    );
    load_call(ctx, call_id).await
}

pub async fn answer_call(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
) -> Result<CallRecord, ApiError> {
    let _guard = ctx.call_mutations.lock().await;
    let mut record = load_call(ctx, call_id).await?;
    if record.initiator_id == user_id {
        return Err(ApiError::validation("the initiator cannot answer their own call"));
    }
    let state = record
        .participant_state(user_id)
        .ok_or_else(|| ApiError::forbidden("user is not part of this call"))?;
    if record.status.is_terminal() {
        return Err(ApiError::conflict("call is no longer active"));
    }
    if state == ParticipantState::Answered {
        return Ok(record);
    }

    let now = Utc::now();
    set_participant(&mut record, user_id, ParticipantState::Answered, Some(now));
    if record.status == CallStatus::Ringing {
        record.status = CallStatus::Ongoing;
        record.started_at = Some(now);
    }
    save(ctx, &record).await?;
    info!(call_id = call_id.0, user_id = user_id.0, "calls: answered");
    Ok(record)
}

pub async fn decline_call(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
    reason: DeclineReason,
) -> Result<CallRecord, ApiError> {
    let _guard = ctx.call_mutations.lock().await;
    let record = load_call(ctx, call_id).await?;
    decline_locked(ctx, record, user_id, reason).await
}

pub async fn end_call(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
    reason: EndReason,
) -> Result<CallRecord, ApiError> {
    let _guard = ctx.call_mutations.lock().await;
    let mut record = load_call(ctx, call_id).await?;
    if !record.is_party(user_id) {
        return Err(ApiError::forbidden("user is not part of this call"));
    }
    if record.status.is_terminal() {
        return Ok(record);
    }
    if record.status == CallStatus::Ringing && record.initiator_id != user_id {
        // A callee hanging up before answering is a decline.
        return decline_locked(ctx, record, user_id, DeclineReason::Declined).await;
    }

    let status = match record.status {
        CallStatus::Ringing => CallStatus::Missed,
        _ => CallStatus::Ended,
    };
    miss_pending(&mut record);
    finalize(&mut record, status, Some(reason), Utc::now());
    save(ctx, &record).await?;
    info!(
        call_id = call_id.0,
        user_id = user_id.0,
        status = record.status.as_str(),
        duration_seconds = record.duration_seconds,
        "calls: ended"
    );
    Ok(record)
}

pub async fn leave_call(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
    reason: EndReason,
) -> Result<CallRecord, ApiError> {
    let _guard = ctx.call_mutations.lock().await;
    let mut record = load_call(ctx, call_id).await?;
    if !record.is_group {
        return Err(ApiError::validation(
            "leave is only valid for group calls; end the call instead",
        ));
    }
    if !record.is_party(user_id) {
        return Err(ApiError::forbidden("user is not part of this call"));
    }
    if record.status.is_terminal() {
        return Ok(record);
    }

    if record.initiator_id == user_id {
        record.initiator_left = true;
    } else {
        match record.participant_state(user_id) {
            Some(ParticipantState::Answered) => {
                set_participant(&mut record, user_id, ParticipantState::Left, None)
            }
            Some(ParticipantState::Pending) => {
                set_participant(&mut record, user_id, ParticipantState::Declined, None)
            }
            _ => {}
        }
    }

    let remaining = active_parties(&record);
    if remaining == 0 {
        let status = match record.status {
            CallStatus::Ringing => CallStatus::Missed,
            _ => CallStatus::Ended,
        };
        miss_pending(&mut record);
        finalize(&mut record, status, Some(reason), Utc::now());
    }
    save(ctx, &record).await?;
    info!(
        call_id = call_id.0,
        user_id = user_id.0,
        remaining,
        status = record.status.as_str(),
        "calls: participant left"
    );
    Ok(record)
}

/// Applies the ring timeout. Safe to call on calls that already moved on.
pub async fn expire_call(ctx: &ApiContext, call_id: CallId) -> Result<ExpiredCall, ApiError> {
    let _guard = ctx.call_mutations.lock().await;
    let mut record = load_call(ctx, call_id).await?;
    if record.status.is_terminal() {
        return Ok(ExpiredCall {
            record,
            newly_missed: Vec::new(),
            expired: false,
        });
    }

    let newly_missed = miss_pending(&mut record);
    let expired = record.status == CallStatus::Ringing;
    if expired {
        finalize(&mut record, CallStatus::Missed, None, Utc::now());
    }
    if expired || !newly_missed.is_empty() {
        save(ctx, &record).await?;
        info!(
            call_id = call_id.0,
            missed = newly_missed.len(),
            expired,
            "calls: ring timeout applied"
        );
    }
    Ok(ExpiredCall {
        record,
        newly_missed,
        expired,
    })
}

pub async fn get_call(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
) -> Result<CallRecord, ApiError> {
    let record = load_call(ctx, call_id).await?;
    if !record.is_party(user_id) {
        return Err(ApiError::forbidden("user is not part of this call"));
    }
    Ok(record)
}

/// Call history of a conversation, restricted to calls the user took part in.
pub async fn list_conversation_calls(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: u32,
    before: Option<CallId>,
) -> Result<Vec<CallRecord>, ApiError> {
    let calls = ctx
        .storage
        .list_calls_for_conversation(conversation_id, limit, before)
        .await
        .map_err(internal)?;
    Ok(calls
        .into_iter()
        .filter(|call| call.is_party(user_id))
        .collect())
}

async fn decline_locked(
    ctx: &ApiContext,
    mut record: CallRecord,
    user_id: UserId,
    reason: DeclineReason,
) -> Result<CallRecord, ApiError> {
    if record.initiator_id == user_id {
        return Err(ApiError::validation("the initiator cannot decline their own call"));
    }
    let state = record
        .participant_state(user_id)
        .ok_or_else(|| ApiError::forbidden("user is not part of this call"))?;
    if record.status.is_terminal() || state != ParticipantState::Pending {
        return Ok(record);
    }

    let participant_state = match reason {
        DeclineReason::Declined => ParticipantState::Declined,
        DeclineReason::Busy => ParticipantState::Busy,
    };
    set_participant(&mut record, user_id, participant_state, None);

    let now = Utc::now();
    if !record.is_group {
        let status = match reason {
            DeclineReason::Declined => CallStatus::Declined,
            DeclineReason::Busy => CallStatus::Busy,
        };
        finalize(&mut record, status, None, now);
    } else if record.participants.iter().all(|p| {
        matches!(
            p.state,
            ParticipantState::Declined | ParticipantState::Busy | ParticipantState::Missed
        )
    }) {
        finalize(&mut record, CallStatus::Declined, None, now);
    }

    save(ctx, &record).await?;
    info!(
        call_id = record.call_id.0,
        user_id = user_id.0,
        reason = ?reason,
        status = record.status.as_str(),
        "calls: declined"
    );
    Ok(record)
}

fn normalize_participants(initiator: UserId, raw: &[UserId]) -> Result<Vec<UserId>, ApiError> {
    let mut participants = Vec::with_capacity(raw.len());
    for user_id in raw {
        if *user_id == initiator {
            return Err(ApiError::validation("the initiator cannot be a participant"));
        }
        if !participants.contains(user_id) {
            participants.push(*user_id);
        }
    }
    if participants.is_empty() {
        return Err(ApiError::validation("a call needs at least one participant"));
    }
    Ok(participants)
}

fn set_participant(
    record: &mut CallRecord,
    user_id: UserId,
    state: ParticipantState,
    answered_at: Option<DateTime<Utc>>,
) {
    if let Some(participant) = record
        .participants
        .iter_mut()
        .find(|p| p.user_id == user_id)
    {
        participant.state = state;
        if participant.answered_at.is_none() {
            participant.answered_at = answered_at;
        }
    }
}

fn miss_pending(record: &mut CallRecord) -> Vec<UserId> {
    let mut missed = Vec::new();
    for participant in &mut record.participants {
        if participant.state == ParticipantState::Pending {
            participant.state = ParticipantState::Missed;
            missed.push(participant.user_id);
        }
    }
    missed
}

/// Parties still in the call: the initiator unless they left, plus everyone answered.
fn active_parties(record: &CallRecord) -> usize {
    let answered = record
        .participants
        .iter()
        .filter(|p| p.state == ParticipantState::Answered)
        .count();
    answered + usize::from(!record.initiator_left)
}

fn finalize(
    record: &mut CallRecord,
    status: CallStatus,
    reason: Option<EndReason>,
    now: DateTime<Utc>,
) {
    record.status = status;
    record.end_reason = reason;
    record.ended_at = Some(now);
    record.duration_seconds = record
        .started_at
        .map(|started_at| (now - started_at).num_seconds().max(0));
}

async fn load_call(ctx: &ApiContext, call_id: CallId) -> Result<CallRecord, ApiError> {
    ctx.storage
        .load_call(call_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("call not found"))
}

async fn save(ctx: &ApiContext, record: &CallRecord) -> Result<(), ApiError> {
    ctx.storage.save_call_state(record).await.map_err(internal)
}

fn token_error(err: TokenError) -> ApiError {
    match err {
        TokenError::InvalidChannelName(_) => ApiError::validation(err.to_string()),
        TokenError::Encode(_) => {
            ApiError::new(ErrorCode::Internal, format!("token mint failed: {err}"))
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
