use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ChatKind, LocalMessageId, MessageId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserChatSummary {
    pub id: ChatId,
    pub login: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChatSummary {
    pub id: ChatId,
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub owner_login: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveChatsResponse {
    #[serde(default)]
    pub users: Vec<UserChatSummary>,
    #[serde(default)]
    pub groups: Vec<GroupChatSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub is_image: bool,
    #[serde(default)]
    pub is_mine: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub time: String,
    pub created_at: DateTime<Utc>,
    /// Correlation id echoed back by servers that persist it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<LocalMessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInviteRequest {
    pub target_login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub detail: String,
}

/// Events pushed over the per-user event socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew {
        chat_type: ChatKind,
        target: String,
        #[serde(default)]
        sender_login: String,
        #[serde(default)]
        sender_name: String,
        #[serde(default)]
        preview: String,
    },
    #[serde(rename = "chat:update")]
    ChatUpdate {
        #[serde(default)]
        chat_type: Option<ChatKind>,
        #[serde(default)]
        target: Option<String>,
    },
    #[serde(rename = "call:invite")]
    CallInvite {
        from_login: String,
        #[serde(default)]
        from_name: String,
    },
}

/// WebRTC-style session description, `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Frames relayed verbatim between the two sockets of a call room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Join,
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
    },
    #[serde(rename = "ice")]
    IceCandidate {
        candidate: IceCandidate,
    },
    Hangup,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join => "join",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice",
            SignalingMessage::Hangup => "hangup",
        }
    }
}
