use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        CallId, CallStatus, CallType, ConversationId, DeclineReason, EndReason, ParticipantState,
        RoomId, StatusId, UserId,
    },
    error::ApiError,
};

/// Messages a client writes to `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientSignal {
    CallInitiate {
        call_id: CallId,
        channel_name: String,
        call_type: CallType,
        is_group: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        target_user_ids: Vec<UserId>,
        caller_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_image: Option<String>,
    },
    CallAnswer {
        call_id: CallId,
        channel_name: String,
    },
    CallDecline {
        call_id: CallId,
        reason: DeclineReason,
    },
    CallEnd {
        call_id: CallId,
        reason: EndReason,
    },
    CallLeave {
        call_id: CallId,
    },
    JoinRoom {
        room: RoomId,
    },
    LeaveRoom {
        room: RoomId,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    StatusReaction {
        status_id: StatusId,
        owner_id: UserId,
        emoji: String,
    },
    RequestOnlineUsers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Messages the server pushes over `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    OnlineUsersUpdated {
        user_ids: Vec<UserId>,
    },
    CallIncoming {
        call_id: CallId,
        from: CallerInfo,
        channel_name: String,
        call_type: CallType,
        is_group: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        participant_ids: Vec<UserId>,
    },
    CallAnswered {
        call_id: CallId,
        user_id: UserId,
        channel_name: String,
    },
    CallDeclined {
        call_id: CallId,
        user_id: UserId,
        reason: DeclineReason,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
    },
    ParticipantLeft {
        call_id: CallId,
        user_id: UserId,
    },
    CallTimeout {
        call_id: CallId,
    },
    CallMissed {
        call_id: CallId,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    StatusReaction {
        status_id: StatusId,
        user_id: UserId,
        emoji: String,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub user_id: UserId,
    pub state: ParticipantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub channel_name: String,
    pub call_type: CallType,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub initiator_id: UserId,
    pub participants: Vec<CallParticipant>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub initiator_left: bool,
}

impl CallRecord {
    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id).collect()
    }

    pub fn participant_state(&self, user_id: UserId) -> Option<ParticipantState> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.state)
    }

    pub fn is_party(&self, user_id: UserId) -> bool {
        self.initiator_id == user_id || self.participant_state(user_id).is_some()
    }

    /// Initiator followed by every participant.
    pub fn parties(&self) -> Vec<UserId> {
        std::iter::once(self.initiator_id)
            .chain(self.participants.iter().map(|p| p.user_id))
            .collect()
    }

    /// Participants who picked up at some point, including those who later left.
    pub fn answered_by(&self) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.answered_at.is_some())
            .map(|p| p.user_id)
            .collect()
    }

    pub fn missed_by(&self) -> Vec<UserId> {
        self.with_states(&[
            ParticipantState::Declined,
            ParticipantState::Busy,
            ParticipantState::Missed,
        ])
    }

    pub fn left_by(&self) -> Vec<UserId> {
        let mut left = self.with_states(&[ParticipantState::Left]);
        if self.initiator_left {
            left.insert(0, self.initiator_id);
        }
        left
    }

    fn with_states(&self, states: &[ParticipantState]) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| states.contains(&p.state))
            .map(|p| p.user_id)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateCallRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub channel_name: String,
    pub call_type: CallType,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallActionRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclineCallRequest {
    pub user_id: UserId,
    #[serde(default = "default_decline_reason")]
    pub reason: DeclineReason,
}

fn default_decline_reason() -> DeclineReason {
    DeclineReason::Declined
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCallRequest {
    pub user_id: UserId,
    #[serde(default = "default_end_reason")]
    pub reason: EndReason,
}

fn default_end_reason() -> EndReason {
    EndReason::Hangup
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTokenRequest {
    pub user_id: UserId,
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTokenResponse {
    pub channel_name: String,
    pub token: String,
    pub media_uid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub user_ids: Vec<UserId>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
