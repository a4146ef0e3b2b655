//! WebSocket protocol message types
//!
//! Every frame is a JSON object tagged by its `type` field.

use crate::error::Error;
use crate::hardware::MacAddress;
use serde::{Deserialize, Deserializer, Serialize};

/// Maximum number of characters kept in an audit preview
pub const AUDIT_PREVIEW_CHARS: usize = 120;

/// Role of a configured identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Parent,
    Child,
}

impl Role {
    /// Parents and admins may audit and administer
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin | Role::Parent)
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "parent" => Ok(Role::Parent),
            "child" => Ok(Role::Child),
            _ => Err(Error::validation("Role must be admin, parent, or child.")),
        }
    }
}

/// PINs arrive as strings from browsers but as numbers from hand-written YAML
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Number(u64),
}

impl From<TextOrNumber> for String {
    fn from(value: TextOrNumber) -> Self {
        match value {
            TextOrNumber::Text(s) => s,
            TextOrNumber::Number(n) => n.to_string(),
        }
    }
}

/// Deserialize a string that may have been written as a number
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    TextOrNumber::deserialize(deserializer).map(String::from)
}

/// Optional variant of [`string_or_number`]; pair with `#[serde(default)]`
pub fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<TextOrNumber>::deserialize(deserializer).map(|v| v.map(String::from))
}

/// Filter for an audit query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Only entries for this identity id
    #[serde(default, alias = "childId", alias = "identityFilter")]
    pub identity_filter: Option<String>,
    /// Inclusive lower bound, epoch milliseconds
    #[serde(default)]
    pub since: Option<i64>,
    /// Inclusive upper bound, epoch milliseconds
    #[serde(default)]
    pub until: Option<i64>,
    /// Maximum entries to return (50 when absent)
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Fields an administrator may change on an existing identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdates {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub pin: Option<String>,
    /// Empty string clears the passphrase
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub mac_required: Option<bool>,
}

/// A new identity submitted by an administrator
///
/// All fields are optional on the wire so a missing field can be reported
/// as a validation error rather than a malformed frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub pin: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Frames sent from the browser to the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// PIN entry
    Auth {
        #[serde(deserialize_with = "string_or_number")]
        pin: String,
    },
    /// Second factor for parents and admins
    Passphrase {
        #[serde(default)]
        passphrase: String,
    },
    /// Chat text for the identity's agent
    ChatMessage {
        #[serde(default)]
        text: String,
    },
    /// Audit log query (parents and admins)
    AuditQuery(AuditQuery),
    AdminGetUsers,
    AdminUpdateUser {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(default)]
        updates: UserUpdates,
    },
    AdminAddMac {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(default)]
        mac: String,
    },
    AdminRemoveMac {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(default)]
        mac: String,
    },
    AdminAddCurrentDevice {
        #[serde(rename = "userId")]
        user_id: String,
    },
    AdminLanScan,
    AdminAddUser {
        #[serde(default)]
        user: NewUser,
    },
    AdminRemoveUser {
        #[serde(rename = "userId", default)]
        user_id: String,
    },
}

impl ClientFrame {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::Passphrase { .. } => "passphrase",
            ClientFrame::ChatMessage { .. } => "chat_message",
            ClientFrame::AuditQuery(_) => "audit_query",
            ClientFrame::AdminGetUsers => "admin_get_users",
            ClientFrame::AdminUpdateUser { .. } => "admin_update_user",
            ClientFrame::AdminAddMac { .. } => "admin_add_mac",
            ClientFrame::AdminRemoveMac { .. } => "admin_remove_mac",
            ClientFrame::AdminAddCurrentDevice { .. } => "admin_add_current_device",
            ClientFrame::AdminLanScan => "admin_lan_scan",
            ClientFrame::AdminAddUser { .. } => "admin_add_user",
            ClientFrame::AdminRemoveUser { .. } => "admin_remove_user",
        }
    }
}

/// Public view of an authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub agent: String,
    pub role: Role,
}

/// Identity summary for the admin panel (no secrets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub macs: Vec<MacAddress>,
    pub has_passphrase: bool,
    pub mac_required: bool,
}

/// A device seen in the local neighbor table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanDevice {
    pub ip: String,
    pub mac: MacAddress,
}

/// Direction of an audited message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the user to the agent
    Inbound,
    /// From the agent to the user
    Outbound,
}

/// One audit log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Epoch milliseconds
    pub ts: i64,
    pub dir: Direction,
    pub user_id: String,
    pub user_name: String,
    pub agent: String,
    pub session_key: String,
    /// Leading characters of the message, not the full text
    pub preview: String,
}

impl AuditEntry {
    /// Build an entry, truncating `text` to [`AUDIT_PREVIEW_CHARS`]
    pub fn new(
        ts: i64,
        dir: Direction,
        user: &UserInfo,
        session_key: impl Into<String>,
        text: &str,
    ) -> Self {
        Self {
            ts,
            dir,
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            agent: user.agent.clone(),
            session_key: session_key.into(),
            preview: text.chars().take(AUDIT_PREVIEW_CHARS).collect(),
        }
    }
}

/// Kinds of streamed chat events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventKind {
    Thinking,
    Token,
    Tool,
    Done,
    AgentPush,
    Error,
}

/// Frames sent from the server to the browser
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection
    Welcome { version: String },
    AuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PassphrasePrompt {
        #[serde(rename = "userName")]
        user_name: String,
    },
    PassphraseError { error: String },
    ChatEvent { event: ChatEventKind, data: String },
    AuditResult { entries: Vec<AuditEntry>, count: usize },
    AdminResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        users: Option<Vec<UserSummary>>,
    },
    AdminUsersResult { users: Vec<UserSummary> },
    AdminLanScanResult {
        devices: Vec<LanDevice>,
        #[serde(rename = "currentMac")]
        current_mac: Option<MacAddress>,
    },
    /// Generic error (malformed frame, not authenticated, ...)
    Error { error: String },
}

impl ServerFrame {
    pub fn auth_ok(user: UserInfo) -> Self {
        ServerFrame::AuthResult {
            success: true,
            user: Some(user),
            error: None,
        }
    }

    pub fn auth_failed(err: &Error) -> Self {
        ServerFrame::AuthResult {
            success: false,
            user: None,
            error: Some(err.to_string()),
        }
    }

    pub fn passphrase_error(err: &Error) -> Self {
        ServerFrame::PassphraseError {
            error: err.to_string(),
        }
    }

    pub fn chat(event: ChatEventKind, data: impl Into<String>) -> Self {
        ServerFrame::ChatEvent {
            event,
            data: data.into(),
        }
    }

    pub fn admin_ok(users: Vec<UserSummary>) -> Self {
        ServerFrame::AdminResult {
            success: true,
            error: None,
            users: Some(users),
        }
    }

    pub fn admin_failed(err: &Error) -> Self {
        ServerFrame::AdminResult {
            success: false,
            error: Some(err.to_string()),
            users: None,
        }
    }

    pub fn error(err: &Error) -> Self {
        ServerFrame::Error {
            error: err.to_string(),
        }
    }
}
