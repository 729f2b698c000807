//! Check-in cadence.
//!
//! The interval table is fixed; next-due is recomputed on every call because
//! both the assigned activity and the latest check-in can change underneath.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{FieldwatchError, Result};
use crate::registry::WorkerRegistry;
use crate::types::{ActivityType, CheckIn, ComplianceState, WorkerId};

pub const DEFAULT_INTERVAL_MINUTES: u32 = 60;
const CHECK_IN_HISTORY_LIMIT: usize = 100;

/// Required minutes between check-ins for an activity type.
pub fn required_interval(activity_type: ActivityType) -> u32 {
    match activity_type {
        ActivityType::Inspection => 30,
        ActivityType::Maintenance => 60,
        ActivityType::Assessment => 45,
        ActivityType::Other => DEFAULT_INTERVAL_MINUTES,
    }
}

/// Classifies elapsed time since the last check-in.
///
/// Due-soon starts at 80% of the interval. Integer math keeps the band edges
/// exact: `elapsed * 5 < interval * 4`.
pub fn classify(
    last_check_in: Option<DateTime<Utc>>,
    interval_minutes: u32,
    now: DateTime<Utc>,
) -> ComplianceState {
    let Some(last) = last_check_in else {
        return ComplianceState::NoCheckIn;
    };
    let elapsed_ms = now.signed_duration_since(last).num_milliseconds().max(0);
    let interval_ms = i64::from(interval_minutes) * 60_000;

    if elapsed_ms >= interval_ms {
        ComplianceState::Overdue
    } else if elapsed_ms.saturating_mul(5) >= interval_ms.saturating_mul(4) {
        ComplianceState::DueSoon
    } else {
        ComplianceState::OnSchedule
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInOutcome {
    Accepted,
    /// Within the debounce window of an already recorded check-in.
    DuplicateSuppressed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInSchedule {
    pub interval_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_in: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due: Option<DateTime<Utc>>,
}

impl CheckInSchedule {
    /// Whole minutes until due, rounded up and floored at zero.
    pub fn minutes_until_due(&self, now: DateTime<Utc>) -> Option<i64> {
        self.next_due.map(|due| {
            let remaining_ms = due.signed_duration_since(now).num_milliseconds();
            if remaining_ms <= 0 {
                0
            } else {
                (remaining_ms + 59_999) / 60_000
            }
        })
    }
}

#[derive(Debug)]
pub struct CheckInScheduler {
    registry: Arc<WorkerRegistry>,
    debounce: Duration,
    check_ins: DashMap<WorkerId, VecDeque<CheckIn>>,
}

impl CheckInScheduler {
    pub fn new(registry: Arc<WorkerRegistry>, debounce_secs: i64) -> Self {
        Self {
            registry,
            debounce: Duration::seconds(debounce_secs.max(0)),
            check_ins: DashMap::new(),
        }
    }

    /// Appends a check-in unless it collapses into a recent one.
    ///
    /// Late check-ins are kept in the log but never move the anchor backwards.
    pub fn record(&self, check_in: CheckIn) -> Result<CheckInOutcome> {
        if !self.registry.contains(&check_in.worker_id) {
            return Err(FieldwatchError::UnknownWorker(check_in.worker_id));
        }
        if !check_in.location.is_valid() {
            return Err(FieldwatchError::InvalidRequest(
                "check-in location is out of range".to_string(),
            ));
        }

        let mut log = self.check_ins.entry(check_in.worker_id.clone()).or_default();
        let duplicate = log.iter().any(|existing| {
            (check_in.timestamp - existing.timestamp).abs() < self.debounce
        });
        if duplicate {
            tracing::debug!(
                worker_id = %check_in.worker_id,
                timestamp = %check_in.timestamp.to_rfc3339(),
                "Duplicate check-in suppressed"
            );
            return Ok(CheckInOutcome::DuplicateSuppressed);
        }

        if log.len() >= CHECK_IN_HISTORY_LIMIT {
            log.pop_front();
        }
        tracing::info!(
            worker_id = %check_in.worker_id,
            timestamp = %check_in.timestamp.to_rfc3339(),
            has_note = check_in.note.is_some(),
            "Check-in recorded"
        );
        log.push_back(check_in);
        Ok(CheckInOutcome::Accepted)
    }

    /// The check-in with the greatest timestamp.
    pub fn last_check_in(&self, worker_id: &str) -> Option<CheckIn> {
        self.check_ins.get(worker_id).and_then(|log| {
            log.iter()
                .max_by_key(|check_in| check_in.timestamp)
                .cloned()
        })
    }

    pub fn check_ins(&self, worker_id: &str) -> Vec<CheckIn> {
        let mut entries: Vec<CheckIn> = self
            .check_ins
            .get(worker_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|check_in| check_in.timestamp);
        entries
    }

    /// Workers that have at least one recorded check-in.
    pub fn ids_with_check_ins(&self) -> Vec<WorkerId> {
        self.check_ins
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Interval for the current activity, or the default when none is assigned.
    pub fn interval_for(&self, worker_id: &str) -> Result<u32> {
        Ok(self
            .registry
            .current_activity(worker_id)?
            .map(|activity| activity.required_interval_minutes)
            .unwrap_or(DEFAULT_INTERVAL_MINUTES))
    }

    pub fn schedule(&self, worker_id: &str) -> Result<CheckInSchedule> {
        let interval_minutes = self.interval_for(worker_id)?;
        let last_check_in = self.last_check_in(worker_id).map(|c| c.timestamp);
        let next_due =
            last_check_in.map(|last| last + Duration::minutes(i64::from(interval_minutes)));
        Ok(CheckInSchedule {
            interval_minutes,
            last_check_in,
            next_due,
        })
    }

    /// `None` when no check-in has been recorded yet.
    pub fn next_due(&self, worker_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.schedule(worker_id)?.next_due)
    }

    /// Reloads a persisted check-in, skipping debounce and logging.
    pub fn restore(&self, check_in: CheckIn) {
        let mut log = self.check_ins.entry(check_in.worker_id.clone()).or_default();
        if log.len() >= CHECK_IN_HISTORY_LIMIT {
            log.pop_front();
        }
        log.push_back(check_in);
    }

    pub fn forget(&self, worker_id: &str) {
        self.check_ins.remove(worker_id);
    }
}
