//! Per-worker compliance state machine.
//!
//! Every worker has a slot guarded by its own mutex. Ticks, check-in
//! re-evaluation and emergency reports for one worker serialize on that slot,
//! and the slot stays locked until the alert manager has applied the
//! transition. Different workers never contend.
//!
//! Emergency is sticky: the periodic classifier never moves a worker out of
//! it. Only `resolve_emergency` does.
//!
//! Every mutation re-checks registration after taking the slot, so nothing
//! can raise an alert for a worker once `retire` has run.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alerts::{AlertManager, TransitionContext};
use crate::dispatcher::{FeedEvent, NotificationDispatcher};
use crate::error::{FieldwatchError, Result};
use crate::location::LocationIngestor;
use crate::registry::WorkerRegistry;
use crate::scheduler::{classify, CheckInScheduler};
use crate::types::{Alert, ComplianceState, EmergencyKind, GeoPoint, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyReport {
    pub kind: EmergencyKind,
    pub reported_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceSnapshot {
    pub state: ComplianceState,
    pub changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency: Option<EmergencyReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub worker_id: WorkerId,
    pub from: ComplianceState,
    pub to: ComplianceState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyOutcome {
    Accepted,
    /// A second press inside the debounce window.
    DuplicateSuppressed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub transitions: Vec<Transition>,
}

#[derive(Debug)]
struct WorkerCompliance {
    state: ComplianceState,
    changed_at: DateTime<Utc>,
    emergency: Option<EmergencyReport>,
    last_press_at: Option<DateTime<Utc>>,
}

impl WorkerCompliance {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: ComplianceState::NoCheckIn,
            changed_at: now,
            emergency: None,
            last_press_at: None,
        }
    }

    fn snapshot(&self) -> ComplianceSnapshot {
        ComplianceSnapshot {
            state: self.state,
            changed_at: self.changed_at,
            emergency: self.emergency.clone(),
        }
    }
}

type Slot = Arc<Mutex<WorkerCompliance>>;

pub struct ComplianceMonitor {
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<CheckInScheduler>,
    locations: Arc<LocationIngestor>,
    alerts: Arc<AlertManager>,
    dispatcher: Arc<NotificationDispatcher>,
    emergency_debounce: Duration,
    slots: DashMap<WorkerId, Slot>,
}

impl ComplianceMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<CheckInScheduler>,
        locations: Arc<LocationIngestor>,
        alerts: Arc<AlertManager>,
        dispatcher: Arc<NotificationDispatcher>,
        emergency_debounce_secs: i64,
    ) -> Self {
        Self {
            registry,
            scheduler,
            locations,
            alerts,
            dispatcher,
            emergency_debounce: Duration::seconds(emergency_debounce_secs.max(0)),
            slots: DashMap::new(),
        }
    }

    /// Clones the slot handle out so the DashMap shard lock is released
    /// before the per-worker mutex is taken.
    fn slot(&self, worker_id: &str, now: DateTime<Utc>) -> Slot {
        self.slots
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WorkerCompliance::new(now))))
            .value()
            .clone()
    }

    fn lock(slot: &Slot) -> MutexGuard<'_, WorkerCompliance> {
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_registered(&self, worker_id: &str) -> Result<()> {
        if self.registry.contains(worker_id) {
            Ok(())
        } else {
            Err(FieldwatchError::UnknownWorker(worker_id.to_string()))
        }
    }

    pub fn state(&self, worker_id: &str) -> ComplianceState {
        self.snapshot(worker_id)
            .map(|snapshot| snapshot.state)
            .unwrap_or(ComplianceState::NoCheckIn)
    }

    pub fn snapshot(&self, worker_id: &str) -> Option<ComplianceSnapshot> {
        let slot = self.slots.get(worker_id).map(|entry| entry.value().clone())?;
        let guard = Self::lock(&slot);
        Some(guard.snapshot())
    }

    /// Re-evaluates every worker with an assigned activity or a recorded
    /// check-in. Workers without an activity run on the default interval.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut worker_ids = self.registry.ids_with_activity();
        worker_ids.extend(self.scheduler.ids_with_check_ins());
        worker_ids.sort();
        worker_ids.dedup();
        for worker_id in worker_ids {
            report.evaluated += 1;
            match self.evaluate_worker(&worker_id, now) {
                Ok(Some(transition)) => report.transitions.push(transition),
                Ok(None) => {}
                // Deactivated between the scan and the evaluation.
                Err(FieldwatchError::UnknownWorker(_)) => {}
                Err(err) => {
                    tracing::error!(worker_id = %worker_id, error = %err, "Compliance evaluation failed");
                }
            }
        }
        if !report.transitions.is_empty() {
            tracing::info!(
                evaluated = report.evaluated,
                transitions = report.transitions.len(),
                "Compliance tick"
            );
        }
        report
    }

    /// Classifies one worker and applies any transition. Emergency is left alone.
    pub fn evaluate_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Transition>> {
        let interval = self.scheduler.interval_for(worker_id)?;
        let slot = self.slot(worker_id, now);
        let mut compliance = Self::lock(&slot);
        self.ensure_registered(worker_id)?;

        if compliance.state == ComplianceState::Emergency {
            return Ok(None);
        }

        let last = self.scheduler.last_check_in(worker_id).map(|c| c.timestamp);
        let next = classify(last, interval, now);
        if next == compliance.state {
            return Ok(None);
        }

        let context = TransitionContext {
            location: self.current_point(worker_id),
            interval_minutes: interval,
            minutes_since_check_in: last.map(|at| now.signed_duration_since(at).num_minutes()),
            emergency_kind: None,
        };
        Ok(Some(self.apply(worker_id, &mut compliance, next, &context, now)))
    }

    /// Moves the worker into Emergency and raises the matching alert.
    ///
    /// While the worker is already in Emergency, a press received within the
    /// debounce window of the previous one is suppressed regardless of kind.
    /// The window is measured on receive time (`now`); `reported_at` comes
    /// from the device clock and is only recorded.
    pub fn report_emergency(
        &self,
        worker_id: &str,
        kind: EmergencyKind,
        reported_at: DateTime<Utc>,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Result<(EmergencyOutcome, Option<Alert>)> {
        self.registry.require(worker_id)?;
        if let Some(point) = &location {
            if !point.is_valid() {
                return Err(FieldwatchError::InvalidRequest(
                    "emergency location is out of range".to_string(),
                ));
            }
        }

        let slot = self.slot(worker_id, now);
        let mut compliance = Self::lock(&slot);
        self.ensure_registered(worker_id)?;

        if compliance.state == ComplianceState::Emergency {
            if let Some(previous) = compliance.last_press_at {
                if (now - previous).abs() < self.emergency_debounce {
                    tracing::debug!(
                        worker_id = %worker_id,
                        kind = ?kind,
                        "Duplicate emergency press suppressed"
                    );
                    return Ok((EmergencyOutcome::DuplicateSuppressed, None));
                }
            }
        }
        compliance.last_press_at = Some(now);

        let location = location.or_else(|| self.current_point(worker_id));
        compliance.emergency = Some(EmergencyReport {
            kind,
            reported_at,
            location,
        });
        tracing::error!(
            worker_id = %worker_id,
            kind = ?kind,
            lat = location.map(|p| p.lat),
            lng = location.map(|p| p.lng),
            "Emergency reported"
        );

        let context = TransitionContext {
            location,
            interval_minutes: self.scheduler.interval_for(worker_id)?,
            minutes_since_check_in: None,
            emergency_kind: Some(kind),
        };
        let transition = self.apply(
            worker_id,
            &mut compliance,
            ComplianceState::Emergency,
            &context,
            now,
        );
        Ok((EmergencyOutcome::Accepted, transition.alert))
    }

    /// Leaves Emergency: resolves the worker's emergency alerts and reclassifies.
    pub fn resolve_emergency(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Transition>> {
        let interval = self.scheduler.interval_for(worker_id)?;
        let slot = self.slot(worker_id, now);
        let mut compliance = Self::lock(&slot);
        self.ensure_registered(worker_id)?;

        if compliance.state != ComplianceState::Emergency {
            return Ok(None);
        }
        for kind in [EmergencyKind::Panic, EmergencyKind::Silent] {
            self.alerts.resolve_open(worker_id, kind.alert_kind(), now);
        }
        compliance.emergency = None;
        compliance.last_press_at = None;

        let last = self.scheduler.last_check_in(worker_id).map(|c| c.timestamp);
        let next = classify(last, interval, now);
        let context = TransitionContext {
            location: self.current_point(worker_id),
            interval_minutes: interval,
            minutes_since_check_in: last.map(|at| now.signed_duration_since(at).num_minutes()),
            emergency_kind: None,
        };
        tracing::info!(worker_id = %worker_id, next = next.as_str(), "Emergency cleared");
        Ok(Some(self.apply(worker_id, &mut compliance, next, &context, now)))
    }

    /// Must be called with the worker's slot held.
    fn apply(
        &self,
        worker_id: &str,
        compliance: &mut WorkerCompliance,
        next: ComplianceState,
        context: &TransitionContext,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = compliance.state;
        compliance.state = next;
        if from != next {
            compliance.changed_at = now;
        }

        let alert = self
            .alerts
            .on_compliance_transition(worker_id, next, context, now);

        if from != next {
            tracing::info!(
                worker_id = %worker_id,
                from = from.as_str(),
                to = next.as_str(),
                "Compliance state changed"
            );
            self.dispatcher.publish(FeedEvent::ComplianceChanged {
                worker_id: worker_id.to_string(),
                from,
                to: next,
                at: now,
            });
        }

        Transition {
            worker_id: worker_id.to_string(),
            from,
            to: next,
            at: now,
            alert,
        }
    }

    fn current_point(&self, worker_id: &str) -> Option<GeoPoint> {
        self.locations
            .current_location(worker_id)
            .map(|sample| sample.point())
    }

    /// Reloads persisted state without raising alerts or feed events.
    pub fn restore(
        &self,
        worker_id: &str,
        state: ComplianceState,
        changed_at: DateTime<Utc>,
        emergency: Option<EmergencyReport>,
    ) {
        let slot = self.slot(worker_id, changed_at);
        let mut compliance = Self::lock(&slot);
        compliance.state = state;
        compliance.changed_at = changed_at;
        compliance.last_press_at = None;
        compliance.emergency = emergency;
    }

    /// Resolves the worker's open alerts and drops their slot.
    ///
    /// Call after the worker has left the registry. The slot is held while
    /// resolving, so an evaluation already in flight either finishes first
    /// (and its alert is resolved here) or sees the worker gone.
    pub fn retire(&self, worker_id: &str, now: DateTime<Utc>) -> Vec<Alert> {
        let slot = self.slots.get(worker_id).map(|entry| entry.value().clone());
        let _guard = slot.as_ref().map(Self::lock);
        let resolved = self.alerts.resolve_all_for_worker(worker_id, now);
        self.slots.remove(worker_id);
        resolved
    }
}
