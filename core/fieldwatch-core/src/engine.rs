//! The engine wires the components together and is the only surface callers
//! (the daemon, tests) talk to.
//!
//! Dependency order: registry <- scheduler / locations <- compliance <- alerts
//! <- dispatcher. Messaging stands apart and never blocks compliance work.
//!
//! Every operation takes `now` explicitly so behaviour is reproducible in tests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::alerts::{AlertFilter, AlertManager};
use crate::compliance::{
    ComplianceMonitor, ComplianceSnapshot, EmergencyOutcome, TickReport, Transition,
};
use crate::config::FieldwatchConfig;
use crate::dispatcher::{DispatcherStats, FeedEvent, NotificationDispatcher, NotificationSink};
use crate::error::{FieldwatchError, Result};
use crate::location::{LocationIngestor, LocationOutcome};
use crate::messaging::{Conversation, ConversationKind, ConversationSummary, Message, MessagingStore};
use crate::registry::WorkerRegistry;
use crate::scheduler::{CheckInOutcome, CheckInSchedule, CheckInScheduler};
use crate::types::{
    Alert, CheckIn, ComplianceState, EmergencyKind, GeoPoint, LocationSample, ScheduledActivity,
    Worker,
};

#[derive(Debug, Clone, Serialize)]
pub struct CheckInReceipt {
    pub outcome: CheckInOutcome,
    pub state: ComplianceState,
    pub schedule: CheckInSchedule,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyReceipt {
    pub outcome: EmergencyOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker: Worker,
    pub compliance: ComplianceSnapshot,
    pub schedule: CheckInSchedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_until_due: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationSample>,
    pub open_alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub no_check_in: usize,
    pub on_schedule: usize,
    pub due_soon: usize,
    pub overdue: usize,
    pub emergency: usize,
}

impl StateCounts {
    fn add(&mut self, state: ComplianceState) {
        match state {
            ComplianceState::NoCheckIn => self.no_check_in += 1,
            ComplianceState::OnSchedule => self.on_schedule += 1,
            ComplianceState::DueSoon => self.due_soon += 1,
            ComplianceState::Overdue => self.overdue += 1,
            ComplianceState::Emergency => self.emergency += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamStatus {
    pub counts: StateCounts,
    pub open_alerts: usize,
    /// Most urgent first.
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineTick {
    pub compliance: TickReport,
    pub escalated: Vec<Alert>,
}

pub struct FieldwatchEngine {
    config: FieldwatchConfig,
    registry: Arc<WorkerRegistry>,
    locations: Arc<LocationIngestor>,
    scheduler: Arc<CheckInScheduler>,
    dispatcher: Arc<NotificationDispatcher>,
    alerts: Arc<AlertManager>,
    monitor: ComplianceMonitor,
    messaging: MessagingStore,
}

impl FieldwatchEngine {
    pub fn new(config: FieldwatchConfig) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let locations = Arc::new(LocationIngestor::new(&config.location));
        let scheduler = Arc::new(CheckInScheduler::new(
            Arc::clone(&registry),
            config.compliance.check_in_debounce_secs,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            config.dispatcher.clone(),
            config.notifications.clone(),
        ));
        let alerts = Arc::new(AlertManager::new(
            Arc::clone(&dispatcher),
            config.alerts.escalation_window_secs,
        ));
        let monitor = ComplianceMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&locations),
            Arc::clone(&alerts),
            Arc::clone(&dispatcher),
            config.compliance.emergency_debounce_secs,
        );
        Self {
            config,
            registry,
            locations,
            scheduler,
            dispatcher,
            alerts,
            monitor,
            messaging: MessagingStore::new(),
        }
    }

    pub fn config(&self) -> &FieldwatchConfig {
        &self.config
    }

    /// Starts background delivery. Without it, events wait for `flush_notifications`.
    pub fn start(&self) {
        self.dispatcher.start();
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    pub fn flush_notifications(&self) {
        self.dispatcher.flush();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_worker(&self, worker: Worker) -> Result<()> {
        self.registry.register(worker)
    }

    /// Removes a worker and resolves anything still open for them.
    pub fn deactivate_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Worker> {
        let worker = self.registry.deactivate(worker_id)?;
        let resolved = self.monitor.retire(worker_id, now);
        self.scheduler.forget(worker_id);
        self.locations.forget(worker_id);
        if !resolved.is_empty() {
            tracing::info!(
                worker_id = %worker_id,
                resolved = resolved.len(),
                "Resolved open alerts for deactivated worker"
            );
        }
        Ok(worker)
    }

    /// Changes the worker's obligation and re-evaluates against the new interval.
    pub fn assign_activity(
        &self,
        worker_id: &str,
        activity: Option<ScheduledActivity>,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        self.registry.assign_activity(worker_id, activity)?;
        self.monitor.evaluate_worker(worker_id, now)
    }

    pub fn worker(&self, worker_id: &str) -> Result<Worker> {
        self.registry.require(worker_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingress
    // ─────────────────────────────────────────────────────────────────────

    pub fn submit_location(
        &self,
        worker_id: &str,
        point: GeoPoint,
        sampled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LocationOutcome> {
        self.registry.require(worker_id)?;
        let accuracy_m = point.accuracy_m.ok_or_else(|| FieldwatchError::InvalidSample {
            worker_id: worker_id.to_string(),
            reason: "accuracy is required".to_string(),
        })?;
        self.locations.submit(LocationSample {
            worker_id: worker_id.to_string(),
            lat: point.lat,
            lng: point.lng,
            accuracy_m,
            sampled_at,
            received_at: now,
        })
    }

    /// Records a check-in and immediately re-evaluates the worker.
    pub fn submit_check_in(&self, check_in: CheckIn, now: DateTime<Utc>) -> Result<CheckInReceipt> {
        let worker_id = check_in.worker_id.clone();
        let outcome = self.scheduler.record(check_in)?;
        if outcome == CheckInOutcome::Accepted {
            self.monitor.evaluate_worker(&worker_id, now)?;
        }
        Ok(CheckInReceipt {
            outcome,
            state: self.monitor.state(&worker_id),
            schedule: self.scheduler.schedule(&worker_id)?,
        })
    }

    pub fn submit_emergency(
        &self,
        worker_id: &str,
        kind: EmergencyKind,
        reported_at: DateTime<Utc>,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Result<EmergencyReceipt> {
        let (outcome, alert) =
            self.monitor
                .report_emergency(worker_id, kind, reported_at, location, now)?;
        Ok(EmergencyReceipt { outcome, alert })
    }

    pub fn resolve_emergency(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Transition>> {
        self.registry.require(worker_id)?;
        self.monitor.resolve_emergency(worker_id, now)
    }

    /// One compliance pass plus alert escalation.
    pub fn tick(&self, now: DateTime<Utc>) -> EngineTick {
        EngineTick {
            compliance: self.monitor.tick(now),
            escalated: self.alerts.escalate_due(now),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Alerts
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.list(filter)
    }

    pub fn acknowledge_alert(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        self.alerts.acknowledge(alert_id, now)
    }

    /// Resolving the last open emergency alert also takes the worker out of Emergency.
    pub fn resolve_alert(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        let alert = self.alerts.resolve(alert_id, now)?;
        if alert.kind.is_emergency() && self.monitor.state(&alert.worker_id) == ComplianceState::Emergency {
            let still_open = self
                .alerts
                .open_for_worker(&alert.worker_id)
                .iter()
                .any(|open| open.kind.is_emergency());
            if !still_open && self.registry.contains(&alert.worker_id) {
                self.monitor.resolve_emergency(&alert.worker_id, now)?;
            }
        }
        Ok(alert)
    }

    /// Opens (or reuses) a direct conversation with the alert's worker and sends `content`.
    pub fn message_worker(
        &self,
        alert_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, Message)> {
        let alert = self
            .alerts
            .get(alert_id)
            .ok_or_else(|| FieldwatchError::UnknownAlert(alert_id.to_string()))?;
        let name = self.registry.get(&alert.worker_id).map(|worker| worker.name);
        let conversation = self.messaging.create_conversation(
            ConversationKind::Direct,
            vec![sender_id.to_string(), alert.worker_id.clone()],
            name,
            now,
        )?;
        let message = self.messaging.send(&conversation.id, sender_id, content, now)?;
        Ok((conversation, message))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messaging
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: Vec<String>,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.messaging.create_conversation(kind, participants, name, now)
    }

    pub fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        self.messaging.send(conversation_id, sender_id, content, now)
    }

    pub fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        self.messaging.mark_read(conversation_id, reader_id)
    }

    pub fn list_conversations(&self, participant_id: &str) -> Vec<ConversationSummary> {
        self.messaging.list_conversations(participant_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.messaging.conversation(conversation_id)
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.messaging.list_messages(conversation_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribes a supervisor session; every open alert is replayed first.
    /// Returns the backlog size.
    pub fn subscribe(&self, session_id: &str, sink: Arc<dyn NotificationSink>) -> usize {
        let backlog: Vec<FeedEvent> = self
            .alerts
            .open_alerts()
            .into_iter()
            .map(|alert| FeedEvent::AlertSnapshot { alert })
            .collect();
        let size = backlog.len();
        self.dispatcher.subscribe(session_id, sink, backlog);
        size
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.dispatcher.unsubscribe(session_id)
    }

    /// Attaches an internal sink (for example persistence) that sees every event.
    pub fn attach_sink(&self, name: &str, sink: Arc<dyn NotificationSink>) {
        self.dispatcher.attach(name, sink);
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn compliance_state(&self, worker_id: &str) -> ComplianceState {
        self.monitor.state(worker_id)
    }

    pub fn worker_status(&self, worker_id: &str, now: DateTime<Utc>) -> Result<WorkerStatus> {
        let worker = self.registry.require(worker_id)?;
        self.status_for(worker, now)
    }

    fn status_for(&self, worker: Worker, now: DateTime<Utc>) -> Result<WorkerStatus> {
        let schedule = self.scheduler.schedule(&worker.id)?;
        let compliance = self
            .monitor
            .snapshot(&worker.id)
            .unwrap_or(ComplianceSnapshot {
                state: ComplianceState::NoCheckIn,
                changed_at: now,
                emergency: None,
            });
        Ok(WorkerStatus {
            minutes_until_due: schedule.minutes_until_due(now),
            location: self.locations.current_location(&worker.id),
            open_alerts: self.alerts.open_for_worker(&worker.id),
            compliance,
            schedule,
            worker,
        })
    }

    /// All workers, most urgent state first, then by name.
    pub fn team_status(&self, now: DateTime<Utc>) -> TeamStatus {
        let mut counts = StateCounts::default();
        let mut workers = Vec::new();
        for worker in self.registry.list() {
            let worker_id = worker.id.clone();
            match self.status_for(worker, now) {
                Ok(status) => {
                    counts.add(status.compliance.state);
                    workers.push(status);
                }
                Err(err) => {
                    tracing::debug!(worker_id = %worker_id, error = %err, "Skipping worker in team status");
                }
            }
        }
        workers.sort_by(|a, b| {
            b.compliance
                .state
                .priority()
                .cmp(&a.compliance.state.priority())
                .then_with(|| a.worker.name.cmp(&b.worker.name))
                .then_with(|| a.worker.id.cmp(&b.worker.id))
        });
        TeamStatus {
            counts,
            open_alerts: self.alerts.open_alerts().len(),
            workers,
        }
    }

    pub fn location_history(&self, worker_id: &str) -> Result<Vec<LocationSample>> {
        self.registry.require(worker_id)?;
        Ok(self.locations.history(worker_id))
    }

    pub fn check_in_history(&self, worker_id: &str) -> Result<Vec<CheckIn>> {
        self.registry.require(worker_id)?;
        Ok(self.scheduler.check_ins(worker_id))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Restore (startup only; nothing is published)
    // ─────────────────────────────────────────────────────────────────────

    pub fn restore_check_in(&self, check_in: CheckIn) {
        self.scheduler.restore(check_in);
    }

    pub fn restore_location(&self, sample: LocationSample) {
        if let Err(err) = self.locations.submit(sample) {
            tracing::debug!(error = %err, "Skipping persisted location sample");
        }
    }

    pub fn restore_compliance(
        &self,
        worker_id: &str,
        snapshot: ComplianceSnapshot,
    ) {
        self.monitor
            .restore(worker_id, snapshot.state, snapshot.changed_at, snapshot.emergency);
    }

    pub fn restore_alert(&self, alert: Alert) {
        self.alerts.restore(alert);
    }

    pub fn restore_conversation(&self, conversation: Conversation, messages: Vec<Message>) {
        self.messaging.restore(conversation, messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MailboxSink;
    use crate::types::ActivityType;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn engine_with_worker() -> FieldwatchEngine {
        let engine = FieldwatchEngine::new(FieldwatchConfig::default());
        let mut worker = Worker::new("w-1", "Ana Reyes", "Arborist", "Parks");
        worker.activity = Some(ScheduledActivity::new(
            "act-1",
            ActivityType::Inspection,
            t0(),
            t0() + Duration::hours(3),
        ));
        engine.register_worker(worker).expect("register");
        engine
    }

    fn check_in(at: DateTime<Utc>) -> CheckIn {
        CheckIn {
            worker_id: "w-1".to_string(),
            timestamp: at,
            location: GeoPoint::new(-37.81, 144.96),
            note: None,
        }
    }

    #[test]
    fn check_in_resolves_missed_alert_immediately() {
        let engine = engine_with_worker();
        engine.submit_check_in(check_in(t0()), t0()).expect("check-in");
        engine.tick(t0() + Duration::minutes(31));
        assert_eq!(engine.list_alerts(&AlertFilter::Open).len(), 1);

        let receipt = engine
            .submit_check_in(check_in(t0() + Duration::minutes(32)), t0() + Duration::minutes(32))
            .expect("check-in");
        assert_eq!(receipt.state, ComplianceState::OnSchedule);
        assert_eq!(receipt.schedule.minutes_until_due(t0() + Duration::minutes(32)), Some(30));
        assert!(engine.list_alerts(&AlertFilter::Open).is_empty());
    }

    #[test]
    fn duplicate_check_in_does_not_move_schedule() {
        let engine = engine_with_worker();
        engine.submit_check_in(check_in(t0()), t0()).expect("first");
        let receipt = engine
            .submit_check_in(check_in(t0() + Duration::seconds(4)), t0() + Duration::seconds(4))
            .expect("second");
        assert_eq!(receipt.outcome, CheckInOutcome::DuplicateSuppressed);
        assert_eq!(receipt.schedule.last_check_in, Some(t0()));
    }

    #[test]
    fn location_requires_accuracy_and_known_worker() {
        let engine = engine_with_worker();
        assert!(matches!(
            engine.submit_location("w-1", GeoPoint::new(-37.8, 144.9), t0(), t0()),
            Err(FieldwatchError::InvalidSample { .. })
        ));
        assert!(matches!(
            engine.submit_location("ghost", GeoPoint::with_accuracy(-37.8, 144.9, 5.0), t0(), t0()),
            Err(FieldwatchError::UnknownWorker(_))
        ));
        assert_eq!(
            engine
                .submit_location("w-1", GeoPoint::with_accuracy(-37.8, 144.9, 5.0), t0(), t0())
                .expect("accepted"),
            LocationOutcome::Accepted
        );
    }

    #[test]
    fn resolving_emergency_alert_clears_emergency_state() {
        let engine = engine_with_worker();
        engine.submit_check_in(check_in(t0()), t0()).expect("check-in");
        let receipt = engine
            .submit_emergency("w-1", EmergencyKind::Panic, t0(), None, t0())
            .expect("emergency");
        let alert = receipt.alert.expect("alert");
        assert_eq!(engine.compliance_state("w-1"), ComplianceState::Emergency);

        engine
            .resolve_alert(&alert.id, t0() + Duration::minutes(5))
            .expect("resolve");
        assert_eq!(engine.compliance_state("w-1"), ComplianceState::OnSchedule);
    }

    #[test]
    fn deactivation_resolves_open_alerts() {
        let engine = engine_with_worker();
        engine
            .submit_emergency("w-1", EmergencyKind::Silent, t0(), None, t0())
            .expect("emergency");
        engine.deactivate_worker("w-1", t0()).expect("deactivate");
        assert!(engine.list_alerts(&AlertFilter::Open).is_empty());
        assert!(engine.worker_status("w-1", t0()).is_err());
    }

    #[test]
    fn subscribe_replays_open_alerts() {
        let engine = engine_with_worker();
        engine
            .submit_emergency("w-1", EmergencyKind::Panic, t0(), None, t0())
            .expect("emergency");
        engine.flush_notifications();

        let mailbox = Arc::new(MailboxSink::new(16));
        assert_eq!(engine.subscribe("sup-session", mailbox.clone()), 1);
        engine.flush_notifications();
        let events = mailbox.drain(16);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "alert_snapshot");
    }

    #[test]
    fn message_worker_reuses_direct_conversation() {
        let engine = engine_with_worker();
        let receipt = engine
            .submit_emergency("w-1", EmergencyKind::Panic, t0(), None, t0())
            .expect("emergency");
        let alert_id = receipt.alert.expect("alert").id;

        let (first, _) = engine
            .message_worker(&alert_id, "sup-1", "Are you safe?", t0())
            .expect("message");
        let (second, _) = engine
            .message_worker(&alert_id, "sup-1", "Reply when you can", t0())
            .expect("message");
        assert_eq!(first.id, second.id);
        assert_eq!(first.name.as_deref(), Some("Ana Reyes"));
        assert_eq!(engine.list_messages(&first.id).expect("list").len(), 2);
    }

    #[test]
    fn team_status_orders_by_urgency() {
        let engine = engine_with_worker();
        engine
            .register_worker(Worker::new("w-2", "Ben Cole", "Ranger", "Parks"))
            .expect("register");
        engine
            .submit_emergency("w-2", EmergencyKind::Panic, t0(), None, t0())
            .expect("emergency");

        let team = engine.team_status(t0());
        assert_eq!(team.workers[0].worker.id, "w-2");
        assert_eq!(team.counts.emergency, 1);
        assert_eq!(team.counts.no_check_in, 1);
        assert_eq!(team.open_alerts, 1);
    }
}
