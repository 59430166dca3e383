//! IPC protocol types and validation for tabwatch-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Opaque browser tab identifier assigned by the host environment.
/// Raw request events may carry `-1` when the host could not attribute a tab.
pub type TabId = i64;

pub const NO_TAB_SENTINEL: TabId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Chatgpt,
    Claude,
    Gemini,
    Notebooklm,
}

impl Service {
    pub fn display_name(&self) -> &'static str {
        match self {
            Service::Chatgpt => "ChatGPT",
            Service::Claude => "Claude",
            Service::Gemini => "Gemini",
            Service::Notebooklm => "NotebookLM",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Chatgpt => "chatgpt",
            Service::Claude => "claude",
            Service::Gemini => "gemini",
            Service::Notebooklm => "notebooklm",
        }
    }

    pub const ALL: [Service; 4] = [
        Service::Chatgpt,
        Service::Claude,
        Service::Gemini,
        Service::Notebooklm,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Idle,
    Generating,
    Completed,
}

impl TabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabStatus::Idle => "idle",
            TabStatus::Generating => "generating",
            TabStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetTabStates,
    Subscribe,
    Event,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum EventKind {
    /// DOM-derived status transition reported by a page detector.
    StatusUpdate,
    /// Explicit completion from a page detector, with human-readable text.
    TaskCompleted,
    /// Page-side intercepted request transition (already classified).
    NetworkEvent,
    /// Raw request-layer event; classification happens in the daemon.
    RawRequest,
    RegisterServiceTab,
    UnregisterServiceTab,
    TabRemoved,
    TabActivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    BeforeSend,
    Completed,
    Error,
}

// IPC contract fields; which are required depends on the event kind, so all
// payload fields stay optional at the serde layer and validate() enforces
// the per-kind shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub kind: EventKind,
    #[serde(default)]
    pub tab_id: Option<TabId>,
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(default)]
    pub status: Option<TabStatus>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub phase: Option<RequestPhase>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        match self.kind {
            EventKind::StatusUpdate | EventKind::NetworkEvent => {
                require_tab_id(&self.tab_id)?;
                require_service(&self.service)?;
                require_status(&self.status)?;
            }
            EventKind::TaskCompleted => {
                require_tab_id(&self.tab_id)?;
                require_service(&self.service)?;
                require_string(&self.message, "message")?;
            }
            EventKind::RawRequest => {
                require_service(&self.service)?;
                require_string(&self.url, "url")?;
                if self.phase.is_none() {
                    return Err(ErrorInfo::new("missing_field", "phase is required"));
                }
                // tab_id may be absent or the -1 sentinel; the daemon resolves it.
            }
            EventKind::RegisterServiceTab | EventKind::UnregisterServiceTab => {
                require_tab_id(&self.tab_id)?;
                require_service(&self.service)?;
            }
            EventKind::TabRemoved | EventKind::TabActivated => {
                require_tab_id(&self.tab_id)?;
            }
        }

        Ok(())
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

/// One tab's authoritative state as seen by presentation surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabStateWire {
    pub service: Service,
    pub status: TabStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Push frames the daemon emits to subscribers. Delivery is best effort;
/// a subscriber with a broken pipe is dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastFrame {
    TabStateUpdate {
        tab_id: TabId,
        state: TabStateWire,
    },
    TaskCompleted {
        tab_id: TabId,
        service: Service,
        message: String,
    },
    TabRemoved {
        tab_id: TabId,
    },
    Badge {
        completed_count: usize,
    },
    /// Corrective push routed back down to the originating page.
    ForceStatus {
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        timestamp: String,
    },
    /// User-facing completion notice; rendering is the bridge's concern.
    Notification {
        tab_id: TabId,
        service: Service,
        title: String,
        message: String,
    },
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

fn require_tab_id(tab_id: &Option<TabId>) -> Result<(), ErrorInfo> {
    match tab_id {
        Some(id) if *id >= 0 => Ok(()),
        Some(_) => Err(ErrorInfo::new("invalid_tab_id", "tab_id must be >= 0")),
        None => Err(ErrorInfo::new("missing_field", "tab_id is required")),
    }
}

fn require_service(service: &Option<Service>) -> Result<(), ErrorInfo> {
    match service {
        Some(_) => Ok(()),
        None => Err(ErrorInfo::new("missing_field", "service is required")),
    }
}

fn require_status(status: &Option<TabStatus>) -> Result<(), ErrorInfo> {
    match status {
        Some(_) => Ok(()),
        None => Err(ErrorInfo::new("missing_field", "status is required")),
    }
}
