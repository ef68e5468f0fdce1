use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{CallId, ConnectionId, DeclineReason, EndReason, RoomId, UserId},
    error::ApiError,
    protocol::{CallRecord, CallerInfo, ClientSignal, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

const MAX_EMOJI_LEN: usize = 32;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    user_id: i64,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let connection_id = state.presence.next_connection_id();
    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state
        .presence
        .register_connection(user_id, connection_id, events_tx)
        .await;
    info!(user_id = user_id.0, %connection_id, "signaling: connected");

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let result = match serde_json::from_str::<ClientSignal>(&text) {
            Ok(signal) => dispatch(&state, connection_id, user_id, signal).await,
            Err(error) => Err(ApiError::validation(format!("malformed signal: {error}"))),
        };
        if let Err(error) = result {
            warn!(
                user_id = user_id.0,
                %connection_id,
                code = ?error.code,
                message = %error.message,
                "signaling: rejected signal"
            );
            state
                .relay
                .emit_to_connection(connection_id, &ServerEvent::Error(error))
                .await;
        }
    }

    let calls = state.relay.calls_joined_by(connection_id).await;
    state.relay.drop_connection(connection_id).await;
    state.presence.unregister_connection(connection_id).await;
    send_task.abort();
    info!(user_id = user_id.0, %connection_id, "signaling: disconnected");
    for call_id in calls {
        hang_up_dropped_call(&state, user_id, call_id).await;
    }
}

pub(crate) async fn dispatch(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    user_id: UserId,
    signal: ClientSignal,
) -> Result<(), ApiError> {
    match signal {
        ClientSignal::CallInitiate {
            call_id,
            target_user_ids,
            caller_name,
            caller_image,
            ..
        } => {
            let record = server_api::get_call(&state.api, user_id, call_id).await?;
            if record.initiator_id != user_id {
                return Err(ApiError::forbidden("only the initiator can ring a call"));
            }
            if record.status.is_terminal() {
                return Err(ApiError::conflict("call is no longer active"));
            }
            state.relay.join_room(connection_id, RoomId::Call(call_id)).await;

            let name = match caller_name.trim() {
                "" => state
                    .api
                    .storage
                    .username_for_user(user_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| format!("user {user_id}")),
                name => name.to_string(),
            };
            let incoming = ServerEvent::CallIncoming {
                call_id,
                from: CallerInfo {
                    user_id,
                    name,
                    picture: caller_image,
                },
                channel_name: record.channel_name.clone(),
                call_type: record.call_type,
                is_group: record.is_group,
                group_name: record.group_name.clone(),
                participant_ids: record.parties(),
            };
            let mut delivered = 0;
            for target in target_user_ids {
                if record.participant_state(target).is_none() {
                    debug!(
                        call_id = call_id.0,
                        target = target.0,
                        "signaling: skipping non-participant"
                    );
                    continue;
                }
                delivered += state.relay.emit_to_user(target, &incoming).await;
            }
            info!(call_id = call_id.0, initiator = user_id.0, delivered, "signaling: call ringing");
            arm_ring_timeout(state, call_id).await;
        }
        ClientSignal::CallAnswer { call_id, .. } => {
            let record = server_api::get_call(&state.api, user_id, call_id).await?;
            let room = RoomId::Call(call_id);
            state.relay.join_room(connection_id, room).await;
            let answered = ServerEvent::CallAnswered {
                call_id,
                user_id,
                channel_name: record.channel_name,
            };
            state
                .relay
                .emit_to_room(room, &answered, Some(connection_id))
                .await;
            // Other devices of the same user stop ringing.
            state
                .relay
                .emit_to_user_except(user_id, &answered, Some(connection_id))
                .await;
        }
        ClientSignal::CallDecline { call_id, reason } => {
            let record = match reason {
                DeclineReason::Busy => {
                    server_api::decline_call(&state.api, user_id, call_id, reason).await?
                }
                DeclineReason::Declined => {
                    server_api::get_call(&state.api, user_id, call_id).await?
                }
            };
            let declined = ServerEvent::CallDeclined {
                call_id,
                user_id,
                reason,
            };
            emit_to_room_and_user(state, RoomId::Call(call_id), record.initiator_id, &declined)
                .await;
            state
                .relay
                .emit_to_user_except(user_id, &declined, Some(connection_id))
                .await;
            if record.status.is_terminal() {
                state.relay.close_room(RoomId::Call(call_id)).await;
            }
        }
        ClientSignal::CallEnd { call_id, reason } => {
            let record = server_api::get_call(&state.api, user_id, call_id).await?;
            announce_end(state, user_id, &record, reason).await;
            info!(call_id = call_id.0, user_id = user_id.0, "signaling: call ended");
        }
        ClientSignal::CallLeave { call_id } => {
            let record = server_api::get_call(&state.api, user_id, call_id).await?;
            state
                .relay
                .leave_room(connection_id, RoomId::Call(call_id))
                .await;
            announce_leave(state, user_id, &record).await;
        }
        ClientSignal::JoinRoom { room } => {
            if let RoomId::Call(call_id) = room {
                server_api::get_call(&state.api, user_id, call_id).await?;
            }
            state.relay.join_room(connection_id, room).await;
        }
        ClientSignal::LeaveRoom { room } => {
            state.relay.leave_room(connection_id, room).await;
        }
        ClientSignal::Typing {
            conversation_id,
            is_typing,
        } => {
            state
                .relay
                .emit_to_room(
                    RoomId::Conversation(conversation_id),
                    &ServerEvent::Typing {
                        conversation_id,
                        user_id,
                        is_typing,
                    },
                    Some(connection_id),
                )
                .await;
        }
        ClientSignal::StatusReaction {
            status_id,
            owner_id,
            emoji,
        } => {
            let emoji = emoji.trim();
            if emoji.is_empty() || emoji.len() > MAX_EMOJI_LEN {
                return Err(ApiError::validation("invalid reaction"));
            }
            state
                .relay
                .emit_to_user(
                    owner_id,
                    &ServerEvent::StatusReaction {
                        status_id,
                        user_id,
                        emoji: emoji.to_string(),
                    },
                )
                .await;
        }
        ClientSignal::RequestOnlineUsers => {
            state.presence.request_snapshot(connection_id).await;
        }
    }
    Ok(())
}

/// Tells the other parties a call is over and dissolves its room.
async fn announce_end(state: &AppState, user_id: UserId, record: &CallRecord, reason: EndReason) {
    let event = closing_event(record, reason);
    for party in record.parties() {
        if party != user_id {
            state.relay.emit_to_user(party, &event).await;
        }
    }
    state.relay.close_room(RoomId::Call(record.call_id)).await;
}

async fn announce_leave(state: &AppState, user_id: UserId, record: &CallRecord) {
    let call_id = record.call_id;
    state
        .relay
        .emit_to_room(
            RoomId::Call(call_id),
            &ServerEvent::ParticipantLeft { call_id, user_id },
            None,
        )
        .await;
    if record.status.is_terminal() {
        let reason = record.end_reason.unwrap_or(EndReason::Hangup);
        announce_end(state, user_id, record, reason).await;
    }
}

/// Sends to everyone in a call room and to `user_id`'s devices outside it,
/// never twice to one socket.
async fn emit_to_room_and_user(
    state: &AppState,
    room: RoomId,
    user_id: UserId,
    event: &ServerEvent,
) {
    let in_room = state.relay.room_members(room).await;
    state.relay.emit_to_room(room, event, None).await;
    for connection_id in state.presence.connections_for(user_id).await {
        if !in_room.contains(&connection_id) {
            state.relay.emit_to_connection(connection_id, event).await;
        }
    }
}

/// Hangs up for a user whose socket vanished mid-call, unless another of
/// their devices is still in the call room.
async fn hang_up_dropped_call(state: &AppState, user_id: UserId, call_id: CallId) {
    let members = state.relay.room_members(RoomId::Call(call_id)).await;
    let devices = state.presence.connections_for(user_id).await;
    if devices.iter().any(|connection_id| members.contains(connection_id)) {
        return;
    }

    let reason = EndReason::Disconnected;
    let result = match server_api::get_call(&state.api, user_id, call_id).await {
        Ok(record) if record.status.is_terminal() => return,
        Ok(record) if record.is_group => {
            server_api::leave_call(&state.api, user_id, call_id, reason).await
        }
        Ok(_) => server_api::end_call(&state.api, user_id, call_id, reason).await,
        Err(error) => Err(error),
    };
    let record = match result {
        Ok(record) => record,
        Err(error) => {
            warn!(
                call_id = call_id.0,
                user_id = user_id.0,
                message = %error.message,
                "signaling: hangup after disconnect failed"
            );
            return;
        }
    };
    if record.is_group {
        announce_leave(state, user_id, &record).await;
    } else {
        announce_end(state, user_id, &record, reason).await;
    }
    info!(
        call_id = call_id.0,
        user_id = user_id.0,
        status = record.status.as_str(),
        "signaling: call dropped with connection"
    );
}

/// `call_missed` for calls nobody picked up, `call_ended` otherwise.
fn closing_event(record: &CallRecord, reason: EndReason) -> ServerEvent {
    if record.answered_by().is_empty() {
        ServerEvent::CallMissed {
            call_id: record.call_id,
        }
    } else {
        ServerEvent::CallEnded {
            call_id: record.call_id,
            reason,
        }
    }
}

async fn arm_ring_timeout(state: &Arc<AppState>, call_id: CallId) {
    if !state.ringing.lock().await.insert(call_id) {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.ring_timeout).await;
        state.ringing.lock().await.remove(&call_id);
        let outcome = match server_api::expire_call(&state.api, call_id).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    call_id = call_id.0,
                    message = %error.message,
                    "signaling: ring timeout failed"
                );
                return;
            }
        };

        let room = RoomId::Call(call_id);
        let missed = ServerEvent::CallMissed { call_id };
        for user_id in &outcome.newly_missed {
            state.relay.emit_to_user(*user_id, &missed).await;
        }
        if outcome.expired {
            let timeout = ServerEvent::CallTimeout { call_id };
            emit_to_room_and_user(&state, room, outcome.record.initiator_id, &timeout).await;
            state.relay.close_room(room).await;
            info!(call_id = call_id.0, "signaling: call timed out");
        } else {
            // The call went on without them.
            for user_id in outcome.newly_missed {
                let left = ServerEvent::ParticipantLeft { call_id, user_id };
                state.relay.emit_to_room(room, &left, None).await;
            }
        }
    });
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
