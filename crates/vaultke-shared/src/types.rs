use serde::{Deserialize, Serialize};

/// Encryption scheme recorded in an envelope's `securityLevel` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Pairwise session encryption with forward-ratcheted chain keys.
    #[serde(rename = "MILITARY_GRADE")]
    MilitaryGrade,
    /// Symmetric room-key encryption shared by all members of a room.
    #[serde(rename = "GROUP_ENCRYPTED")]
    GroupEncrypted,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MilitaryGrade => "MILITARY_GRADE",
            Self::GroupEncrypted => "GROUP_ENCRYPTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MILITARY_GRADE" => Some(Self::MilitaryGrade),
            "GROUP_ENCRYPTED" => Some(Self::GroupEncrypted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat room category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    /// Exactly two members, fixed for the room's life.
    Private,
    /// Group room bound to a chama (savings group).
    Chama,
    /// Free-standing group room.
    Group,
    /// Member-to-operator support room.
    Support,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Chama => "chama",
            Self::Group => "group",
            Self::Support => "support",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "chama" => Some(Self::Chama),
            "group" => Some(Self::Group),
            "support" => Some(Self::Support),
            _ => None,
        }
    }

    /// Whether messages in this room default to the group cipher.
    pub fn is_group(&self) -> bool {
        !matches!(self, Self::Private)
    }
}

/// Role of a user inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Owner,
    Member,
}

impl RoomRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// Kind of an archived message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Location,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Location => "location",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "location" => Some(Self::Location),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// System notices are relayed and archived as plaintext.
    pub fn is_plaintext(&self) -> bool {
        matches!(self, Self::System)
    }
}
