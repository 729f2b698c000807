//! Shared daemon state: the engine, its store, and polling mailboxes.
//!
//! The engine is authoritative in memory. Ingress that changes durable data
//! goes through here so the store is written only after the engine accepts.
//! Store failures are logged and never fail the request.

use chrono::{DateTime, Utc};
use fieldwatch_core::{
    AlertFilter, AlertKind, CheckIn, CheckInOutcome, CheckInReceipt, ComplianceSnapshot,
    ComplianceState, Conversation, ConversationKind, EmergencyKind, EmergencyReport,
    FeedEvent, FieldwatchEngine, GeoPoint, LocationOutcome, LocationSample, MailboxSink, Message,
    Result, ScheduledActivity, Transition, Worker,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::{ComplianceRow, Db, FeedStoreSink};

const STORE_SINK_NAME: &str = "internal:store";

pub struct SharedState {
    engine: Arc<FieldwatchEngine>,
    db: Arc<Db>,
    mailboxes: Mutex<HashMap<String, Arc<MailboxSink>>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RestoreSummary {
    pub workers: usize,
    pub check_ins: usize,
    pub locations: usize,
    pub alerts: usize,
    pub compliance: usize,
    pub conversations: usize,
}

impl SharedState {
    /// Reloads persisted state into `engine`, then attaches the store to the feed.
    pub fn new(engine: Arc<FieldwatchEngine>, db: Arc<Db>) -> Self {
        let state = Self {
            engine,
            db,
            mailboxes: Mutex::new(HashMap::new()),
        };
        let summary = state.restore();
        tracing::info!(
            workers = summary.workers,
            check_ins = summary.check_ins,
            locations = summary.locations,
            alerts = summary.alerts,
            compliance = summary.compliance,
            conversations = summary.conversations,
            "Restored persisted state"
        );
        state.engine.attach_sink(
            STORE_SINK_NAME,
            Arc::new(FeedStoreSink::new(Arc::clone(&state.db))),
        );
        state
    }

    pub fn engine(&self) -> &FieldwatchEngine {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────────
    // Durable ingress
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_worker(&self, worker: Worker) -> Result<()> {
        self.engine.register_worker(worker.clone())?;
        self.persist("worker", self.db.upsert_worker(&worker));
        Ok(())
    }

    pub fn deactivate_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Worker> {
        let worker = self.engine.deactivate_worker(worker_id, now)?;
        self.persist("worker removal", self.db.delete_worker(worker_id));
        Ok(worker)
    }

    pub fn assign_activity(
        &self,
        worker_id: &str,
        activity: Option<ScheduledActivity>,
        now: DateTime<Utc>,
    ) -> Result<(Worker, Option<Transition>)> {
        let transition = self.engine.assign_activity(worker_id, activity, now)?;
        let worker = self.engine.worker(worker_id)?;
        self.persist("worker", self.db.upsert_worker(&worker));
        Ok((worker, transition))
    }

    pub fn submit_location(
        &self,
        worker_id: &str,
        point: GeoPoint,
        sampled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LocationOutcome> {
        let outcome = self.engine.submit_location(worker_id, point, sampled_at, now)?;
        if outcome == LocationOutcome::Accepted {
            let sample = LocationSample {
                worker_id: worker_id.to_string(),
                lat: point.lat,
                lng: point.lng,
                accuracy_m: point.accuracy_m.unwrap_or_default(),
                sampled_at,
                received_at: now,
            };
            self.persist("location", self.db.insert_location(&sample));
        }
        Ok(outcome)
    }

    pub fn submit_check_in(&self, check_in: CheckIn, now: DateTime<Utc>) -> Result<CheckInReceipt> {
        let receipt = self.engine.submit_check_in(check_in.clone(), now)?;
        if receipt.outcome == CheckInOutcome::Accepted {
            self.persist("check-in", self.db.insert_check_in(&check_in));
        }
        Ok(receipt)
    }

    pub fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: Vec<String>,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let conversation = self
            .engine
            .create_conversation(kind, participants, name, now)?;
        self.persist("conversation", self.db.save_conversation(&conversation, &[]));
        Ok(conversation)
    }

    pub fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let message = self
            .engine
            .send_message(conversation_id, sender_id, content, now)?;
        self.persist_message(&message);
        Ok(message)
    }

    pub fn message_worker(
        &self,
        alert_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, Message)> {
        let (_, message) = self
            .engine
            .message_worker(alert_id, sender_id, content, now)?;
        self.persist_message(&message);
        let conversation = self.engine.conversation(&message.conversation_id)?;
        Ok((conversation, message))
    }

    pub fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        let marked = self.engine.mark_read(conversation_id, reader_id)?;
        if marked > 0 {
            let conversation = self.engine.conversation(conversation_id)?;
            let messages = self.engine.list_messages(conversation_id)?;
            self.persist(
                "read receipts",
                self.db.save_conversation(&conversation, &messages),
            );
        }
        Ok(marked)
    }

    fn persist_message(&self, message: &Message) {
        match self.engine.conversation(&message.conversation_id) {
            Ok(conversation) => self.persist(
                "message",
                self.db
                    .save_conversation(&conversation, std::slice::from_ref(message)),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "Conversation vanished before persisting message");
            }
        }
    }

    fn persist(&self, what: &str, result: std::result::Result<(), String>) {
        if let Err(err) = result {
            tracing::warn!(error = %err, what, "Failed to persist daemon state");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Supervisor feed
    // ─────────────────────────────────────────────────────────────────────

    /// (Re)subscribes a session with a fresh mailbox. Returns the backlog size.
    pub fn subscribe(&self, session_id: &str) -> usize {
        let capacity = self.engine.config().dispatcher.mailbox_capacity;
        let mailbox = Arc::new(MailboxSink::new(capacity));
        lock(&self.mailboxes).insert(session_id.to_string(), Arc::clone(&mailbox));
        let backlog = self.engine.subscribe(session_id, mailbox);
        tracing::info!(session_id = %session_id, backlog, "Session subscribed");
        backlog
    }

    /// Drains up to `max` queued events; `None` if the session is not subscribed.
    pub fn poll(&self, session_id: &str, max: usize) -> Option<Vec<FeedEvent>> {
        let mailbox = lock(&self.mailboxes).get(session_id).cloned()?;
        Some(mailbox.drain(max))
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let had_mailbox = lock(&self.mailboxes).remove(session_id).is_some();
        let had_subscription = self.engine.unsubscribe(session_id);
        had_mailbox || had_subscription
    }

    pub fn session_count(&self) -> usize {
        lock(&self.mailboxes).len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Restore
    // ─────────────────────────────────────────────────────────────────────

    fn restore(&self) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        let mut worker_ids = Vec::new();
        match self.db.list_workers() {
            Ok(workers) => {
                for worker in workers {
                    let worker_id = worker.id.clone();
                    match self.engine.register_worker(worker) {
                        Ok(()) => worker_ids.push(worker_id),
                        Err(err) => {
                            tracing::warn!(worker_id = %worker_id, error = %err, "Skipping persisted worker");
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to load persisted workers"),
        }
        summary.workers = worker_ids.len();

        match self.db.list_check_ins() {
            Ok(check_ins) => {
                summary.check_ins = check_ins.len();
                for check_in in check_ins {
                    self.engine.restore_check_in(check_in);
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to load persisted check-ins"),
        }

        match self.db.list_locations() {
            Ok(samples) => {
                summary.locations = samples.len();
                for sample in samples {
                    self.engine.restore_location(sample);
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to load persisted locations"),
        }

        match self.db.list_alerts() {
            Ok(alerts) => {
                summary.alerts = alerts.len();
                for alert in alerts {
                    self.engine.restore_alert(alert);
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to load persisted alerts"),
        }

        let mut rows: HashMap<String, ComplianceRow> = match self.db.list_compliance() {
            Ok(rows) => rows
                .into_iter()
                .map(|row| (row.worker_id.clone(), row))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load persisted compliance");
                HashMap::new()
            }
        };
        for worker_id in &worker_ids {
            if let Some(snapshot) = self.compliance_snapshot(worker_id, rows.remove(worker_id)) {
                self.engine.restore_compliance(worker_id, snapshot);
                summary.compliance += 1;
            }
        }

        match self.db.list_conversations() {
            Ok(threads) => {
                summary.conversations = threads.len();
                for (conversation, messages) in threads {
                    self.engine.restore_conversation(conversation, messages);
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to load persisted conversations"),
        }

        summary
    }

    /// An open emergency alert outranks whatever state was last written.
    fn compliance_snapshot(
        &self,
        worker_id: &str,
        row: Option<ComplianceRow>,
    ) -> Option<ComplianceSnapshot> {
        let emergency = self
            .engine
            .list_alerts(&AlertFilter::Worker(worker_id.to_string()))
            .into_iter()
            .filter(|alert| alert.status.is_open())
            .find_map(|alert| {
                emergency_kind(alert.kind).map(|kind| EmergencyReport {
                    kind,
                    reported_at: alert.created_at,
                    location: alert.location,
                })
            });
        match (emergency, row) {
            (Some(report), row) => Some(ComplianceSnapshot {
                state: ComplianceState::Emergency,
                changed_at: row.map_or(report.reported_at, |row| row.changed_at),
                emergency: Some(report),
            }),
            (None, Some(row)) => Some(ComplianceSnapshot {
                state: row.state,
                changed_at: row.changed_at,
                emergency: None,
            }),
            (None, None) => None,
        }
    }
}

fn emergency_kind(kind: AlertKind) -> Option<EmergencyKind> {
    match kind {
        AlertKind::EmergencyPanic => Some(EmergencyKind::Panic),
        AlertKind::EmergencySilent => Some(EmergencyKind::Silent),
        AlertKind::MissedCheckin => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use fieldwatch_core::{ActivityType, AlertStatus, FieldwatchConfig};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn worker() -> Worker {
        let mut worker = Worker::new("w-1", "Ana Reyes", "Arborist", "Parks");
        worker.activity = Some(ScheduledActivity::new(
            "act-1",
            ActivityType::Inspection,
            t0() - Duration::hours(1),
            t0() + Duration::hours(6),
        ));
        worker
    }

    fn open_state(dir: &tempfile::TempDir) -> SharedState {
        open_state_with(dir, FieldwatchConfig::default())
    }

    fn open_state_with(dir: &tempfile::TempDir, config: FieldwatchConfig) -> SharedState {
        let engine = Arc::new(FieldwatchEngine::new(config));
        let db = Arc::new(Db::new(dir.path().join("state.db"), 100).expect("db init"));
        SharedState::new(engine, db)
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().expect("temp dir");
        let alert_id = {
            let state = open_state(&dir);
            state.register_worker(worker()).expect("register");
            state
                .submit_check_in(
                    CheckIn {
                        worker_id: "w-1".to_string(),
                        timestamp: t0(),
                        location: GeoPoint::new(-41.2, 174.7),
                        note: None,
                    },
                    t0(),
                )
                .expect("check-in");
            state.engine().tick(t0() + Duration::minutes(31));
            state.engine().flush_notifications();
            let alerts = state.engine().list_alerts(&AlertFilter::Active);
            assert_eq!(alerts.len(), 1);
            alerts[0].id.clone()
        };

        let state = open_state(&dir);
        assert_eq!(
            state.engine().compliance_state("w-1"),
            ComplianceState::Overdue
        );
        let alerts = state.engine().list_alerts(&AlertFilter::All);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, alert_id);
        assert_eq!(alerts[0].status, AlertStatus::Active);
        assert_eq!(
            state.engine().check_in_history("w-1").expect("history").len(),
            1
        );
    }

    #[test]
    fn open_emergency_alert_restores_emergency_state() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let state = open_state(&dir);
            state.register_worker(worker()).expect("register");
            state
                .engine()
                .submit_emergency("w-1", EmergencyKind::Silent, t0(), None, t0())
                .expect("emergency");
            state.engine().flush_notifications();
        }

        let state = open_state(&dir);
        let status = state.engine().worker_status("w-1", t0()).expect("status");
        assert_eq!(status.compliance.state, ComplianceState::Emergency);
        assert_eq!(
            status.compliance.emergency.map(|e| e.kind),
            Some(EmergencyKind::Silent)
        );
    }

    #[test]
    fn alerts_persist_when_the_feed_queue_overflows() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = FieldwatchConfig::default();
        config.dispatcher.queue_capacity = 4;
        {
            let state = open_state_with(&dir, config.clone());
            for n in 0..6 {
                let mut crew = worker();
                crew.id = format!("w-{}", n);
                state.register_worker(crew.clone()).expect("register");
                state
                    .engine()
                    .submit_emergency(&crew.id, EmergencyKind::Panic, t0(), None, t0())
                    .expect("emergency");
            }
            assert!(state.engine().dispatcher_stats().dropped > 0);
            state.engine().flush_notifications();
        }

        let state = open_state_with(&dir, config);
        assert_eq!(state.engine().list_alerts(&AlertFilter::Active).len(), 6);
        assert_eq!(state.engine().team_status(t0()).counts.emergency, 6);
    }

    #[test]
    fn polling_unknown_session_returns_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = open_state(&dir);
        assert!(state.poll("sup-1", 10).is_none());

        assert_eq!(state.subscribe("sup-1"), 0);
        assert_eq!(state.poll("sup-1", 10).map(|events| events.len()), Some(0));
        assert!(state.unsubscribe("sup-1"));
        assert!(!state.unsubscribe("sup-1"));
    }

    #[test]
    fn messages_survive_restart() {
        let dir = tempfile::tempdir().expect("temp dir");
        let conversation_id = {
            let state = open_state(&dir);
            let conversation = state
                .create_conversation(
                    ConversationKind::Direct,
                    vec!["sup-1".to_string(), "w-1".to_string()],
                    None,
                    t0(),
                )
                .expect("create");
            state
                .send_message(&conversation.id, "sup-1", "Status?", t0())
                .expect("send");
            state.mark_read(&conversation.id, "w-1").expect("read");
            conversation.id
        };

        let state = open_state(&dir);
        let messages = state
            .engine()
            .list_messages(&conversation_id)
            .expect("messages");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].read_by.contains("w-1"));
    }
}
