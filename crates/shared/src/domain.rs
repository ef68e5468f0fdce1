use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(CallId);
id_newtype!(StatusId);

/// Server-assigned id of one live websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

impl UserId {
    /// Numeric identity used inside media rooms.
    ///
    /// FNV-1a over the decimal form of the id, so every participant derives
    /// the same value for a peer without a lookup. Zero is reserved by media
    /// backends for "assign one for me" and is remapped to 1.
    pub fn media_uid(self) -> u32 {
        let hash = self
            .0
            .to_string()
            .bytes()
            .fold(FNV_OFFSET_BASIS, |hash, byte| {
                (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
            });
        if hash == 0 {
            1
        } else {
            hash
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "audio" => Some(CallType::Audio),
            "video" => Some(CallType::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Declined,
    Missed,
    Busy,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Ended => "ended",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Busy => "busy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ringing" => Some(CallStatus::Ringing),
            "ongoing" => Some(CallStatus::Ongoing),
            "ended" => Some(CallStatus::Ended),
            "declined" => Some(CallStatus::Declined),
            "missed" => Some(CallStatus::Missed),
            "busy" => Some(CallStatus::Busy),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Ringing | CallStatus::Ongoing)
    }
}

/// Per-participant outcome, tracked independently of the call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Pending,
    Answered,
    Declined,
    Busy,
    Missed,
    Left,
}

impl ParticipantState {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantState::Pending => "pending",
            ParticipantState::Answered => "answered",
            ParticipantState::Declined => "declined",
            ParticipantState::Busy => "busy",
            ParticipantState::Missed => "missed",
            ParticipantState::Left => "left",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ParticipantState::Pending),
            "answered" => Some(ParticipantState::Answered),
            "declined" => Some(ParticipantState::Declined),
            "busy" => Some(ParticipantState::Busy),
            "missed" => Some(ParticipantState::Missed),
            "left" => Some(ParticipantState::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    Declined,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Cancelled,
    Failed,
    Disconnected,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Cancelled => "cancelled",
            EndReason::Failed => "failed",
            EndReason::Disconnected => "disconnected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hangup" => Some(EndReason::Hangup),
            "cancelled" => Some(EndReason::Cancelled),
            "failed" => Some(EndReason::Failed),
            "disconnected" => Some(EndReason::Disconnected),
            _ => None,
        }
    }
}

/// Relay room names. Membership is per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RoomId {
    Conversation(ConversationId),
    Call(CallId),
    Status(StatusId),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Conversation(id) => write!(f, "conversation:{id}"),
            RoomId::Call(id) => write!(f, "call:{id}"),
            RoomId::Status(id) => write!(f, "status:{id}"),
        }
    }
}
