//! Alert lifecycle.
//!
//! One book behind one mutex: the alert map and an index of open alerts keyed
//! by `(worker, kind)`. Upserts consult the index under the same lock, so two
//! racing transitions for one worker can never both create an alert.
//!
//! Lifecycle: Active -> Acknowledged -> Resolved, or Active -> Resolved.
//! Resolved is terminal. Acknowledged alerts stay open and keep absorbing
//! upserts until they are resolved.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dispatcher::{FeedEvent, NotificationDispatcher};
use crate::error::{FieldwatchError, Result};
use crate::types::{
    new_id, Alert, AlertKind, AlertStatus, ComplianceState, EmergencyKind, GeoPoint, WorkerId,
};

/// What the monitor knew when a worker changed state.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub location: Option<GeoPoint>,
    pub interval_minutes: u32,
    pub minutes_since_check_in: Option<i64>,
    pub emergency_kind: Option<EmergencyKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "filter", content = "value", rename_all = "snake_case")]
pub enum AlertFilter {
    #[default]
    All,
    /// Active or acknowledged.
    Open,
    Active,
    Kind(AlertKind),
    Worker(WorkerId),
}

impl AlertFilter {
    fn matches(&self, alert: &Alert) -> bool {
        match self {
            AlertFilter::All => true,
            AlertFilter::Open => alert.status.is_open(),
            AlertFilter::Active => alert.status == AlertStatus::Active,
            AlertFilter::Kind(kind) => alert.kind == *kind,
            AlertFilter::Worker(worker_id) => alert.worker_id == *worker_id,
        }
    }
}

#[derive(Debug, Default)]
struct AlertBook {
    alerts: HashMap<String, Alert>,
    open: HashMap<(WorkerId, AlertKind), String>,
}

impl AlertBook {
    fn open_alert_mut(&mut self, worker_id: &str, kind: AlertKind) -> Option<&mut Alert> {
        let id = self.open.get(&(worker_id.to_string(), kind))?;
        self.alerts.get_mut(id)
    }

    fn close(&mut self, id: &str, now: DateTime<Utc>) -> Option<Alert> {
        let alert = self.alerts.get_mut(id)?;
        if !alert.status.is_open() {
            return None;
        }
        alert.status = AlertStatus::Resolved;
        alert.updated_at = now;
        alert.resolved_at = Some(now);
        let key = (alert.worker_id.clone(), alert.kind);
        let resolved = alert.clone();
        if self.open.get(&key).map(String::as_str) == Some(id) {
            self.open.remove(&key);
        }
        Some(resolved)
    }
}

pub struct AlertManager {
    book: Mutex<AlertBook>,
    dispatcher: Arc<NotificationDispatcher>,
    escalation_window: Duration,
}

impl AlertManager {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, escalation_window_secs: i64) -> Self {
        Self {
            book: Mutex::new(AlertBook::default()),
            dispatcher,
            escalation_window: Duration::seconds(escalation_window_secs.max(1)),
        }
    }

    fn book(&self) -> MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies the alert side of a compliance transition.
    ///
    /// DueSoon/Overdue upsert a missed check-in alert, Emergency upserts the
    /// matching emergency alert, OnSchedule resolves an open missed check-in.
    pub fn on_compliance_transition(
        &self,
        worker_id: &str,
        state: ComplianceState,
        context: &TransitionContext,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        match state {
            ComplianceState::DueSoon | ComplianceState::Overdue => Some(self.upsert(
                worker_id,
                AlertKind::MissedCheckin,
                state,
                context,
                now,
            )),
            ComplianceState::Emergency => {
                let kind = context
                    .emergency_kind
                    .unwrap_or(EmergencyKind::Panic)
                    .alert_kind();
                Some(self.upsert(worker_id, kind, state, context, now))
            }
            ComplianceState::OnSchedule => {
                self.resolve_open(worker_id, AlertKind::MissedCheckin, now)
            }
            ComplianceState::NoCheckIn => None,
        }
    }

    /// Creates an alert, or refreshes the open one for `(worker, kind)`.
    pub fn upsert(
        &self,
        worker_id: &str,
        kind: AlertKind,
        trigger_state: ComplianceState,
        context: &TransitionContext,
        now: DateTime<Utc>,
    ) -> Alert {
        let message = alert_message(kind, trigger_state, context);
        let mut book = self.book();

        let refreshed = book.open_alert_mut(worker_id, kind).map(|existing| {
            existing.updated_at = now;
            existing.trigger_state = trigger_state;
            existing.message = message.clone();
            if context.location.is_some() {
                existing.location = context.location;
            }
            existing.clone()
        });
        if let Some(alert) = refreshed {
            drop(book);
            tracing::info!(
                alert_id = %alert.id,
                worker_id = %worker_id,
                kind = kind.as_str(),
                trigger = trigger_state.as_str(),
                "Alert refreshed"
            );
            self.dispatcher.publish(FeedEvent::AlertUpdated {
                alert: alert.clone(),
            });
            return alert;
        }

        debug_assert!(
            !book
                .alerts
                .values()
                .any(|a| a.worker_id == worker_id && a.kind == kind && a.status.is_open()),
            "open alert missing from index"
        );

        let alert = Alert {
            id: new_id("alert"),
            worker_id: worker_id.to_string(),
            kind,
            status: AlertStatus::Active,
            created_at: now,
            updated_at: now,
            last_escalated_at: None,
            escalation_count: 0,
            message,
            location: context.location,
            trigger_state,
            resolved_at: None,
        };
        book.open
            .insert((worker_id.to_string(), kind), alert.id.clone());
        book.alerts.insert(alert.id.clone(), alert.clone());
        drop(book);

        tracing::warn!(
            alert_id = %alert.id,
            worker_id = %worker_id,
            kind = kind.as_str(),
            trigger = trigger_state.as_str(),
            "Alert raised"
        );
        self.dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert.clone(),
        });
        alert
    }

    /// Active -> Acknowledged. Acknowledged or resolved alerts are returned unchanged.
    pub fn acknowledge(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut book = self.book();
        let alert = book
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| FieldwatchError::UnknownAlert(alert_id.to_string()))?;
        if alert.status != AlertStatus::Active {
            return Ok(alert.clone());
        }
        alert.status = AlertStatus::Acknowledged;
        alert.updated_at = now;
        let alert = alert.clone();
        drop(book);

        tracing::info!(alert_id = %alert_id, worker_id = %alert.worker_id, "Alert acknowledged");
        self.dispatcher.publish(FeedEvent::AlertUpdated {
            alert: alert.clone(),
        });
        Ok(alert)
    }

    /// Any open state -> Resolved. Resolving twice is a no-op.
    pub fn resolve(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut book = self.book();
        let Some(existing) = book.alerts.get(alert_id) else {
            return Err(FieldwatchError::UnknownAlert(alert_id.to_string()));
        };
        if !existing.status.is_open() {
            return Ok(existing.clone());
        }
        let resolved = book.close(alert_id, now);
        drop(book);

        match resolved {
            Some(alert) => {
                self.announce_resolved(&alert);
                Ok(alert)
            }
            None => Err(FieldwatchError::UnknownAlert(alert_id.to_string())),
        }
    }

    /// Resolves the open `(worker, kind)` alert, if any.
    pub fn resolve_open(
        &self,
        worker_id: &str,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let mut book = self.book();
        let id = book.open.get(&(worker_id.to_string(), kind))?.clone();
        let resolved = book.close(&id, now);
        drop(book);
        if let Some(alert) = &resolved {
            self.announce_resolved(alert);
        }
        resolved
    }

    /// Resolves every open alert for a worker.
    pub fn resolve_all_for_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Vec<Alert> {
        [
            AlertKind::MissedCheckin,
            AlertKind::EmergencyPanic,
            AlertKind::EmergencySilent,
        ]
        .into_iter()
        .filter_map(|kind| self.resolve_open(worker_id, kind, now))
        .collect()
    }

    fn announce_resolved(&self, alert: &Alert) {
        tracing::info!(
            alert_id = %alert.id,
            worker_id = %alert.worker_id,
            kind = alert.kind.as_str(),
            "Alert resolved"
        );
        self.dispatcher.publish(FeedEvent::AlertUpdated {
            alert: alert.clone(),
        });
    }

    /// Re-notifies Active alerts that nobody has acknowledged within the window.
    pub fn escalate_due(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut escalated = Vec::new();
        {
            let mut book = self.book();
            for alert in book.alerts.values_mut() {
                if alert.status != AlertStatus::Active {
                    continue;
                }
                let since = alert.last_escalated_at.unwrap_or(alert.created_at);
                if now.signed_duration_since(since) < self.escalation_window {
                    continue;
                }
                alert.escalation_count += 1;
                alert.last_escalated_at = Some(now);
                escalated.push(alert.clone());
            }
        }

        escalated.sort_by(|a, b| a.id.cmp(&b.id));
        for alert in &escalated {
            tracing::warn!(
                alert_id = %alert.id,
                worker_id = %alert.worker_id,
                kind = alert.kind.as_str(),
                escalation_count = alert.escalation_count,
                "Alert escalated"
            );
            self.dispatcher.publish(FeedEvent::AlertEscalated {
                alert: alert.clone(),
            });
        }
        escalated
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        self.book().alerts.get(alert_id).cloned()
    }

    /// Emergency alerts first, then most recently updated.
    pub fn list(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .book()
            .alerts
            .values()
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect();
        sort_for_display(&mut alerts);
        alerts
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        self.list(&AlertFilter::Open)
    }

    pub fn open_for_worker(&self, worker_id: &str) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .book()
            .alerts
            .values()
            .filter(|alert| alert.worker_id == worker_id && alert.status.is_open())
            .cloned()
            .collect();
        sort_for_display(&mut alerts);
        alerts
    }

    /// Counts open alerts by scanning the map rather than trusting the index.
    pub fn open_count(&self, worker_id: &str, kind: AlertKind) -> usize {
        self.book()
            .alerts
            .values()
            .filter(|a| a.worker_id == worker_id && a.kind == kind && a.status.is_open())
            .count()
    }

    /// Reloads a persisted alert without publishing it.
    pub fn restore(&self, alert: Alert) {
        let mut book = self.book();
        if alert.status.is_open() {
            let key = (alert.worker_id.clone(), alert.kind);
            if let Some(previous) = book.open.get(&key).cloned() {
                tracing::warn!(
                    alert_id = %alert.id,
                    superseded = %previous,
                    "Duplicate open alert in store; keeping the newer one open"
                );
                let keep_new = book
                    .alerts
                    .get(&previous)
                    .map_or(true, |prev| prev.updated_at <= alert.updated_at);
                if !keep_new {
                    let mut stale = alert;
                    stale.status = AlertStatus::Resolved;
                    stale.resolved_at = Some(stale.updated_at);
                    book.alerts.insert(stale.id.clone(), stale);
                    return;
                }
                book.close(&previous, alert.updated_at);
            }
            book.open.insert(key, alert.id.clone());
        }
        book.alerts.insert(alert.id.clone(), alert);
    }
}

fn sort_for_display(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| {
        b.kind
            .is_emergency()
            .cmp(&a.kind.is_emergency())
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn alert_message(kind: AlertKind, state: ComplianceState, context: &TransitionContext) -> String {
    match kind {
        AlertKind::EmergencyPanic => {
            "Panic button activated. Emergency assistance requested.".to_string()
        }
        AlertKind::EmergencySilent => "Silent duress alert activated.".to_string(),
        AlertKind::MissedCheckin => {
            let overdue_by = context
                .minutes_since_check_in
                .map(|elapsed| elapsed - i64::from(context.interval_minutes));
            match (state, overdue_by) {
                (ComplianceState::Overdue, Some(minutes)) if minutes > 0 => {
                    format!("Missed scheduled check-in ({} minutes overdue).", minutes)
                }
                (ComplianceState::Overdue, _) => "Missed scheduled check-in.".to_string(),
                (_, Some(minutes)) => format!(
                    "Check-in due within {} minutes.",
                    minutes.unsigned_abs().max(1)
                ),
                _ => "Check-in due soon.".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherConfig, NotificationConfig};
    use chrono::TimeZone;

    fn manager() -> AlertManager {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            DispatcherConfig::default(),
            NotificationConfig::default(),
        ));
        AlertManager::new(dispatcher, 300)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn overdue_context() -> TransitionContext {
        TransitionContext {
            location: Some(GeoPoint::new(-37.81, 144.96)),
            interval_minutes: 30,
            minutes_since_check_in: Some(31),
            emergency_kind: None,
        }
    }

    #[test]
    fn repeated_transitions_upsert_one_alert() {
        let alerts = manager();
        let first = alerts
            .on_compliance_transition("w-1", ComplianceState::DueSoon, &overdue_context(), t0())
            .expect("alert");
        let second = alerts
            .on_compliance_transition(
                "w-1",
                ComplianceState::Overdue,
                &overdue_context(),
                t0() + Duration::minutes(6),
            )
            .expect("alert");

        assert_eq!(first.id, second.id);
        assert_eq!(second.trigger_state, ComplianceState::Overdue);
        assert_eq!(second.updated_at, t0() + Duration::minutes(6));
        assert_eq!(alerts.open_count("w-1", AlertKind::MissedCheckin), 1);
        assert!(second.message.contains("1 minutes overdue"));
    }

    #[test]
    fn acknowledged_alert_absorbs_upserts() {
        let alerts = manager();
        let alert = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0(),
        );
        alerts.acknowledge(&alert.id, t0()).expect("ack");
        let again = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0() + Duration::minutes(1),
        );
        assert_eq!(again.id, alert.id);
        assert_eq!(again.status, AlertStatus::Acknowledged);
    }

    #[test]
    fn on_schedule_resolves_missed_checkin() {
        let alerts = manager();
        let alert = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0(),
        );
        let resolved = alerts
            .on_compliance_transition(
                "w-1",
                ComplianceState::OnSchedule,
                &TransitionContext::default(),
                t0() + Duration::minutes(2),
            )
            .expect("resolved");
        assert_eq!(resolved.id, alert.id);
        assert_eq!(resolved.status, AlertStatus::Resolved);

        let fresh = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::DueSoon,
            &overdue_context(),
            t0() + Duration::minutes(30),
        );
        assert_ne!(fresh.id, alert.id);
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let alerts = manager();
        let alert = alerts.upsert(
            "w-1",
            AlertKind::EmergencyPanic,
            ComplianceState::Emergency,
            &TransitionContext::default(),
            t0(),
        );
        let resolved = alerts.resolve(&alert.id, t0()).expect("resolve");
        assert_eq!(resolved.status, AlertStatus::Resolved);

        let after_ack = alerts.acknowledge(&alert.id, t0()).expect("ack is no-op");
        assert_eq!(after_ack.status, AlertStatus::Resolved);
        let again = alerts.resolve(&alert.id, t0()).expect("resolve twice");
        assert_eq!(again.resolved_at, Some(t0()));
    }

    #[test]
    fn unknown_alert_is_an_error() {
        let alerts = manager();
        assert!(matches!(
            alerts.acknowledge("alert-missing", t0()),
            Err(FieldwatchError::UnknownAlert(_))
        ));
    }

    #[test]
    fn list_puts_emergencies_first() {
        let alerts = manager();
        alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0() + Duration::minutes(5),
        );
        alerts.upsert(
            "w-2",
            AlertKind::EmergencySilent,
            ComplianceState::Emergency,
            &TransitionContext::default(),
            t0(),
        );
        let listed = alerts.list(&AlertFilter::All);
        assert_eq!(listed[0].kind, AlertKind::EmergencySilent);
        assert_eq!(listed[1].kind, AlertKind::MissedCheckin);

        let only_w1 = alerts.list(&AlertFilter::Worker("w-1".to_string()));
        assert_eq!(only_w1.len(), 1);
    }

    #[test]
    fn escalation_repeats_each_window_until_acknowledged() {
        let alerts = manager();
        let alert = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0(),
        );
        assert!(alerts.escalate_due(t0() + Duration::minutes(4)).is_empty());

        let first = alerts.escalate_due(t0() + Duration::minutes(5));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].escalation_count, 1);
        assert!(alerts.escalate_due(t0() + Duration::minutes(6)).is_empty());

        alerts.acknowledge(&alert.id, t0() + Duration::minutes(7)).expect("ack");
        assert!(alerts.escalate_due(t0() + Duration::minutes(20)).is_empty());
    }

    #[test]
    fn restore_keeps_single_open_alert_per_key() {
        let alerts = manager();
        let mut older = alerts.upsert(
            "w-1",
            AlertKind::MissedCheckin,
            ComplianceState::Overdue,
            &overdue_context(),
            t0(),
        );
        older.id = "alert-older".to_string();
        let mut newer = older.clone();
        newer.id = "alert-newer".to_string();
        newer.updated_at = t0() + Duration::minutes(1);

        let restored = manager();
        restored.restore(older);
        restored.restore(newer);
        assert_eq!(restored.open_count("w-1", AlertKind::MissedCheckin), 1);
        assert_eq!(
            restored.get("alert-older").map(|a| a.status),
            Some(AlertStatus::Resolved)
        );
    }
}
