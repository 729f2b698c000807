//! IPC protocol types and validation for fieldwatch-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! Framing: one JSON request per line, one JSON response per line.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_ID_LEN: usize = 128;
pub const MAX_POLL_EVENTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    // Workers
    RegisterWorker,
    DeactivateWorker,
    AssignActivity,
    // Ingress
    SubmitLocation,
    SubmitCheckIn,
    SubmitEmergency,
    ResolveEmergency,
    // Queries
    GetWorkerStatus,
    GetTeamStatus,
    GetLocationHistory,
    // Alerts
    ListAlerts,
    AcknowledgeAlert,
    ResolveAlert,
    MessageWorker,
    // Messaging
    CreateConversation,
    SendMessage,
    MarkRead,
    ListConversations,
    ListMessages,
    // Feed
    Subscribe,
    PollFeed,
    Unsubscribe,
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

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
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

/// Request parameters that can check themselves before reaching the engine.
pub trait Validate {
    fn validate(&self) -> Result<(), ErrorInfo>;
}

/// Decodes and validates `params`. A missing object is treated as `{}`.
pub fn parse_params<T>(params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned + Validate,
{
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));
    let parsed: T = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new("invalid_params", format!("params are invalid: {}", err))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

/// Parses an RFC3339 timestamp into UTC.
pub fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, ErrorInfo> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| ErrorInfo::new("invalid_timestamp", format!("{} must be RFC3339", field)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActivityParams {
    pub activity_id: String,
    /// inspection | maintenance | assessment; anything else uses the default interval.
    pub activity_type: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
}

impl Validate for ActivityParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.activity_id, "activity_id")?;
        let start = parse_timestamp(&self.start, "start")?;
        let end = parse_timestamp(&self.end, "end")?;
        if end <= start {
            return Err(ErrorInfo::new("invalid_params", "end must be after start"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegisterWorkerParams {
    pub worker_id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub activity: Option<ActivityParams>,
}

impl Validate for RegisterWorkerParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")?;
        require_text(&self.name, "name")?;
        if let Some(activity) = &self.activity {
            activity.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AssignActivityParams {
    pub worker_id: String,
    /// `null` clears the worker's obligation.
    #[serde(default)]
    pub activity: Option<ActivityParams>,
}

impl Validate for AssignActivityParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")?;
        if let Some(activity) = &self.activity {
            activity.validate()?;
        }
        Ok(())
    }
}

/// Used by every method that only names a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkerParams {
    pub worker_id: String,
}

impl Validate for WorkerParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

impl Validate for EmptyParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingress
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubmitLocationParams {
    pub worker_id: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub sampled_at: String,
}

impl Validate for SubmitLocationParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")?;
        parse_timestamp(&self.sampled_at, "sampled_at")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubmitCheckInParams {
    pub worker_id: String,
    pub timestamp: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Validate for SubmitCheckInParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")?;
        parse_timestamp(&self.timestamp, "timestamp")?;
        require_coordinates(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyKindParam {
    Panic,
    Silent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubmitEmergencyParams {
    pub worker_id: String,
    pub kind: EmergencyKindParam,
    pub timestamp: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl Validate for SubmitEmergencyParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.worker_id, "worker_id")?;
        parse_timestamp(&self.timestamp, "timestamp")?;
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => require_coordinates(lat, lng),
            (None, None) => Ok(()),
            _ => Err(ErrorInfo::new(
                "invalid_params",
                "lat and lng must be given together",
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatusFilter {
    #[default]
    All,
    Open,
    Active,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListAlertsParams {
    #[serde(default)]
    pub status: AlertStatusFilter,
    /// missed_checkin | emergency_panic | emergency_silent
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
}

pub const ALERT_KINDS: [&str; 3] = ["missed_checkin", "emergency_panic", "emergency_silent"];

impl Validate for ListAlertsParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(kind) = &self.kind {
            if !ALERT_KINDS.contains(&kind.as_str()) {
                return Err(ErrorInfo::new(
                    "invalid_params",
                    format!("unknown alert kind: {}", kind),
                ));
            }
        }
        if let Some(worker_id) = &self.worker_id {
            require_id(worker_id, "worker_id")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AlertParams {
    pub alert_id: String,
}

impl Validate for AlertParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.alert_id, "alert_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MessageWorkerParams {
    pub alert_id: String,
    pub sender_id: String,
    pub content: String,
}

impl Validate for MessageWorkerParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.alert_id, "alert_id")?;
        require_id(&self.sender_id, "sender_id")?;
        require_text(&self.content, "content")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messaging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKindParam {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationParams {
    pub kind: ConversationKindParam,
    pub participants: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Validate for CreateConversationParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if self.participants.len() < 2 {
            return Err(ErrorInfo::new(
                "invalid_params",
                "participants must list at least two ids",
            ));
        }
        for participant in &self.participants {
            require_id(participant, "participants[]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SendMessageParams {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
}

impl Validate for SendMessageParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.conversation_id, "conversation_id")?;
        require_id(&self.sender_id, "sender_id")?;
        require_text(&self.content, "content")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MarkReadParams {
    pub conversation_id: String,
    pub reader_id: String,
}

impl Validate for MarkReadParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.conversation_id, "conversation_id")?;
        require_id(&self.reader_id, "reader_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListConversationsParams {
    pub participant_id: String,
}

impl Validate for ListConversationsParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.participant_id, "participant_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConversationParams {
    pub conversation_id: String,
}

impl Validate for ConversationParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.conversation_id, "conversation_id")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feed
// ─────────────────────────────────────────────────────────────────────────────

/// `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub session_id: String,
}

impl Validate for SessionParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PollFeedParams {
    pub session_id: String,
    #[serde(default)]
    pub max_events: Option<usize>,
}

impl PollFeedParams {
    pub fn limit(&self) -> usize {
        self.max_events.unwrap_or(100).clamp(1, MAX_POLL_EVENTS)
    }
}

impl Validate for PollFeedParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be {} characters or fewer", field, MAX_ID_LEN),
        ));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_coordinates(lat: f64, lng: f64) -> Result<(), ErrorInfo> {
    let in_range = lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng);
    if in_range {
        Ok(())
    } else {
        Err(ErrorInfo::new(
            "invalid_params",
            format!("coordinates out of range ({}, {})", lat, lng),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_rejects_unknown_method() {
        let raw = r#"{"protocol_version":1,"method":"drop_tables"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn request_parses_snake_case_method() {
        let raw = r#"{"protocol_version":1,"method":"submit_check_in","id":"r1"}"#;
        let request: Request = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.method, Method::SubmitCheckIn);
        assert_eq!(request.id.as_deref(), Some("r1"));
    }

    #[test]
    fn check_in_params_validate() {
        let params: SubmitCheckInParams = parse_params(Some(json!({
            "worker_id": "w-1",
            "timestamp": "2026-03-02T10:00:00Z",
            "lat": -37.81,
            "lng": 144.96,
            "note": "on site"
        })))
        .expect("valid");
        assert_eq!(params.note.as_deref(), Some("on site"));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let err = parse_params::<SubmitLocationParams>(Some(json!({
            "worker_id": "w-1",
            "lat": 0.0,
            "lng": 0.0,
            "accuracy_m": 5.0,
            "sampled_at": "yesterday"
        })))
        .expect_err("invalid");
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_params::<WorkerParams>(Some(json!({
            "worker_id": "w-1",
            "extra": true
        })))
        .expect_err("invalid");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_long_ids() {
        let err = parse_params::<WorkerParams>(Some(json!({ "worker_id": "a".repeat(256) })))
            .expect_err("invalid");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn emergency_needs_both_coordinates() {
        let err = parse_params::<SubmitEmergencyParams>(Some(json!({
            "worker_id": "w-1",
            "kind": "panic",
            "timestamp": "2026-03-02T10:00:00Z",
            "lat": -37.81
        })))
        .expect_err("invalid");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn activity_window_must_be_ordered() {
        let err = parse_params::<AssignActivityParams>(Some(json!({
            "worker_id": "w-1",
            "activity": {
                "activity_id": "a-1",
                "activity_type": "inspection",
                "start": "2026-03-02T12:00:00Z",
                "end": "2026-03-02T09:00:00Z"
            }
        })))
        .expect_err("invalid");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn activity_interval_cannot_be_supplied() {
        let err = parse_params::<RegisterWorkerParams>(Some(json!({
            "worker_id": "w-1",
            "name": "Sam Ortiz",
            "activity": {
                "activity_id": "a-1",
                "activity_type": "inspection",
                "start": "2026-03-02T09:00:00Z",
                "end": "2026-03-02T17:00:00Z",
                "required_interval_minutes": 600
            }
        })))
        .expect_err("invalid");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn list_alerts_defaults_to_all() {
        let params: ListAlertsParams = parse_params(None).expect("defaults");
        assert_eq!(params.status, AlertStatusFilter::All);
        assert!(parse_params::<ListAlertsParams>(Some(json!({ "kind": "fire" }))).is_err());
    }

    #[test]
    fn poll_limit_is_clamped() {
        let params = PollFeedParams {
            session_id: "s".to_string(),
            max_events: Some(10_000),
        };
        assert_eq!(params.limit(), MAX_POLL_EVENTS);
    }
}
