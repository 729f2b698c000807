//! Shared domain types.
//!
//! Everything here is plain data: serializable, cloneable, and free of locks.
//! Components own the mutable state; these types are what they hand out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type WorkerId = String;

/// A position fix attached to check-ins, emergencies and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(lat: f64, lng: f64, accuracy_m: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: Some(accuracy_m),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Inspection,
    Maintenance,
    Assessment,
    Other,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Inspection => "inspection",
            ActivityType::Maintenance => "maintenance",
            ActivityType::Assessment => "assessment",
            ActivityType::Other => "other",
        }
    }

    /// Unknown labels fall back to `Other` so they pick up the default interval.
    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inspection" => ActivityType::Inspection,
            "maintenance" => ActivityType::Maintenance,
            "assessment" => ActivityType::Assessment,
            _ => ActivityType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActivity {
    pub id: String,
    pub activity_type: ActivityType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub required_interval_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

impl ScheduledActivity {
    pub fn new(
        id: impl Into<String>,
        activity_type: ActivityType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            activity_type,
            start,
            end,
            required_interval_minutes: crate::scheduler::required_interval(activity_type),
            title: None,
            site: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub role: String,
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ScheduledActivity>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        department: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            department: department.into(),
            activity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub worker_id: WorkerId,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub sampled_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::with_accuracy(self.lat, self.lng, self.accuracy_m)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub location: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    NoCheckIn,
    OnSchedule,
    DueSoon,
    Overdue,
    Emergency,
}

impl ComplianceState {
    /// Emergency > Overdue > DueSoon > OnSchedule > NoCheckIn.
    pub fn priority(&self) -> u8 {
        match self {
            ComplianceState::Emergency => 4,
            ComplianceState::Overdue => 3,
            ComplianceState::DueSoon => 2,
            ComplianceState::OnSchedule => 1,
            ComplianceState::NoCheckIn => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceState::NoCheckIn => "no_check_in",
            ComplianceState::OnSchedule => "on_schedule",
            ComplianceState::DueSoon => "due_soon",
            ComplianceState::Overdue => "overdue",
            ComplianceState::Emergency => "emergency",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "no_check_in" => Some(ComplianceState::NoCheckIn),
            "on_schedule" => Some(ComplianceState::OnSchedule),
            "due_soon" => Some(ComplianceState::DueSoon),
            "overdue" => Some(ComplianceState::Overdue),
            "emergency" => Some(ComplianceState::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyKind {
    Panic,
    Silent,
}

impl EmergencyKind {
    pub fn alert_kind(&self) -> AlertKind {
        match self {
            EmergencyKind::Panic => AlertKind::EmergencyPanic,
            EmergencyKind::Silent => AlertKind::EmergencySilent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MissedCheckin,
    EmergencyPanic,
    EmergencySilent,
}

impl AlertKind {
    pub fn is_emergency(&self) -> bool {
        matches!(self, AlertKind::EmergencyPanic | AlertKind::EmergencySilent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::MissedCheckin => "missed_checkin",
            AlertKind::EmergencyPanic => "emergency_panic",
            AlertKind::EmergencySilent => "emergency_silent",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "missed_checkin" => Some(AlertKind::MissedCheckin),
            "emergency_panic" => Some(AlertKind::EmergencyPanic),
            "emergency_silent" => Some(AlertKind::EmergencySilent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Active and Acknowledged alerts still need a supervisor.
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub worker_id: WorkerId,
    pub kind: AlertKind,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    /// Time of the most recent transition (creation, upsert, ack, resolve).
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub escalation_count: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub trigger_state: ComplianceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Generates a sortable unique id with a readable prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, ulid::Ulid::new().to_string().to_lowercase())
}
