// WebSocket envelope and message types for the tandem realtime protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every message type that may appear in an envelope's `type` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "authenticate")]
    Authenticate,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "task:deleted")]
    TaskDeleted,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:moved")]
    TaskMoved,
    #[serde(rename = "workspace:created")]
    WorkspaceCreated,
    #[serde(rename = "workspace:updated")]
    WorkspaceUpdated,
    #[serde(rename = "workspace:deleted")]
    WorkspaceDeleted,
    #[serde(rename = "workspace:member_added")]
    WorkspaceMemberAdded,
    #[serde(rename = "workspace:member_removed")]
    WorkspaceMemberRemoved,
    #[serde(rename = "user:presence")]
    UserPresence,
    #[serde(rename = "user:typing")]
    UserTyping,
    #[serde(rename = "cursor:position")]
    CursorPosition,
    #[serde(rename = "sync:request")]
    SyncRequest,
    #[serde(rename = "sync:response")]
    SyncResponse,
    #[serde(rename = "conflict:resolution")]
    ConflictResolution,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unauthorized")]
    Unauthorized,
}

impl MessageType {
    pub const ALL: [MessageType; 23] = [
        Self::Connect,
        Self::Disconnect,
        Self::Authenticate,
        Self::Ping,
        Self::Pong,
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskDeleted,
        Self::TaskCompleted,
        Self::TaskMoved,
        Self::WorkspaceCreated,
        Self::WorkspaceUpdated,
        Self::WorkspaceDeleted,
        Self::WorkspaceMemberAdded,
        Self::WorkspaceMemberRemoved,
        Self::UserPresence,
        Self::UserTyping,
        Self::CursorPosition,
        Self::SyncRequest,
        Self::SyncResponse,
        Self::ConflictResolution,
        Self::Error,
        Self::Unauthorized,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Authenticate => "authenticate",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskDeleted => "task:deleted",
            Self::TaskCompleted => "task:completed",
            Self::TaskMoved => "task:moved",
            Self::WorkspaceCreated => "workspace:created",
            Self::WorkspaceUpdated => "workspace:updated",
            Self::WorkspaceDeleted => "workspace:deleted",
            Self::WorkspaceMemberAdded => "workspace:member_added",
            Self::WorkspaceMemberRemoved => "workspace:member_removed",
            Self::UserPresence => "user:presence",
            Self::UserTyping => "user:typing",
            Self::CursorPosition => "cursor:position",
            Self::SyncRequest => "sync:request",
            Self::SyncResponse => "sync:response",
            Self::ConflictResolution => "conflict:resolution",
            Self::Error => "error",
            Self::Unauthorized => "unauthorized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|message_type| message_type.as_str() == value)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task domain events published by task write-paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventType {
    Created,
    Updated,
    Deleted,
    Completed,
    Moved,
}

impl From<TaskEventType> for MessageType {
    fn from(event: TaskEventType) -> Self {
        match event {
            TaskEventType::Created => Self::TaskCreated,
            TaskEventType::Updated => Self::TaskUpdated,
            TaskEventType::Deleted => Self::TaskDeleted,
            TaskEventType::Completed => Self::TaskCompleted,
            TaskEventType::Moved => Self::TaskMoved,
        }
    }
}

/// Workspace domain events published by workspace write-paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceEventType {
    Created,
    Updated,
    Deleted,
    MemberAdded,
    MemberRemoved,
}

impl WorkspaceEventType {
    /// Membership changes are also delivered to the affected user directly.
    pub const fn targets_member(self) -> bool {
        matches!(self, Self::MemberAdded | Self::MemberRemoved)
    }
}

impl From<WorkspaceEventType> for MessageType {
    fn from(event: WorkspaceEventType) -> Self {
        match event {
            WorkspaceEventType::Created => Self::WorkspaceCreated,
            WorkspaceEventType::Updated => Self::WorkspaceUpdated,
            WorkspaceEventType::Deleted => Self::WorkspaceDeleted,
            WorkspaceEventType::MemberAdded => Self::WorkspaceMemberAdded,
            WorkspaceEventType::MemberRemoved => Self::WorkspaceMemberRemoved,
        }
    }
}

/// The only shape ever placed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self { message_type, data, timestamp: Utc::now(), request_id: None, workspace_id: None }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// `authenticate` request payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub token: String,
    #[serde(default)]
    pub workspace_ids: Vec<String>,
}

/// `authenticate` success reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    pub success: bool,
    pub user_id: String,
}

/// `error` envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

pub fn decode_envelope(raw: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str::<Envelope>(raw)
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
