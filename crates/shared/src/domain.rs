use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(MessageId);
id_newtype!(LocalMessageId);

impl LocalMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Opaque bearer credential. Never validated or refreshed by the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatKind {
    #[serde(rename = "private")]
    User,
    #[serde(rename = "group")]
    Group,
}

impl ChatKind {
    /// Value of the `chat_type` parameter the server expects.
    pub fn wire_name(self) -> &'static str {
        match self {
            ChatKind::User => "private",
            ChatKind::Group => "group",
        }
    }
}

/// Addresses one conversation: a peer login for private chats, a group id for groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef {
    pub kind: ChatKind,
    pub target: String,
}

impl ChatRef {
    pub fn user(login: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::User,
            target: login.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Group,
            target: group_id.into(),
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.wire_name(), self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Both parties derive the same room: sorted logins joined by `__`.
    pub fn for_pair(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}__{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
