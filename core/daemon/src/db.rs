//! SQLite persistence for fieldwatch-daemon.
//!
//! The engine keeps everything in memory; this store makes it survive a
//! restart. Alerts and compliance changes arrive through the notification
//! feed (see `FeedStoreSink`), everything else is written by the request
//! handlers after the engine has accepted it.
//!
//! Timestamps are stored as RFC3339 text. Alerts and messages keep their full
//! JSON payload next to the indexed columns so restore is a straight decode.

use chrono::{DateTime, SecondsFormat, Utc};
use fieldwatch_core::{
    Alert, CheckIn, ComplianceState, Conversation, DeliveryFailure, FeedEvent, GeoPoint,
    LocationSample, Message, NotificationSink, ScheduledActivity, Worker,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;

const CHECK_IN_RETENTION: i64 = 100;

pub struct Db {
    path: PathBuf,
    location_retention: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceRow {
    pub worker_id: String,
    pub state: ComplianceState,
    pub changed_at: DateTime<Utc>,
}

impl Db {
    pub fn new(path: PathBuf, location_retention: usize) -> Result<Self, String> {
        let db = Self {
            path,
            location_retention: location_retention.max(1) as i64,
        };
        db.init_schema()?;
        Ok(db)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────

    pub fn upsert_worker(&self, worker: &Worker) -> Result<(), String> {
        let activity = match &worker.activity {
            Some(activity) => Some(
                serde_json::to_string(activity)
                    .map_err(|err| format!("Failed to serialize activity: {}", err))?,
            ),
            None => None,
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workers (worker_id, name, role, department, activity) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(worker_id) DO UPDATE SET \
                    name = excluded.name, \
                    role = excluded.role, \
                    department = excluded.department, \
                    activity = excluded.activity",
                params![worker.id, worker.name, worker.role, worker.department, activity],
            )
            .map_err(|err| format!("Failed to upsert worker: {}", err))?;
            Ok(())
        })
    }

    /// Drops the worker and their per-worker history. Alerts are kept.
    pub fn delete_worker(&self, worker_id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start transaction: {}", err))?;
            for table in ["workers", "check_ins", "locations", "compliance"] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE worker_id = ?1", table),
                    params![worker_id],
                )
                .map_err(|err| format!("Failed to delete from {}: {}", table, err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit worker delete: {}", err))
        })
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT worker_id, name, role, department, activity \
                     FROM workers ORDER BY worker_id ASC",
                )
                .map_err(|err| format!("Failed to prepare workers query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(|err| format!("Failed to read worker rows: {}", err))?;

            let mut workers = Vec::new();
            for row in rows {
                let (id, name, role, department, activity) =
                    row.map_err(|err| format!("Failed to decode worker row: {}", err))?;
                let activity = match activity {
                    Some(raw) => Some(
                        serde_json::from_str::<ScheduledActivity>(&raw)
                            .map_err(|err| format!("Failed to parse activity for {}: {}", id, err))?,
                    ),
                    None => None,
                };
                workers.push(Worker {
                    id,
                    name,
                    role,
                    department,
                    activity,
                });
            }
            Ok(workers)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Check-ins and locations
    // ─────────────────────────────────────────────────────────────────────

    pub fn insert_check_in(&self, check_in: &CheckIn) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO check_ins (worker_id, timestamp, lat, lng, accuracy_m, note) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(worker_id, timestamp) DO NOTHING",
                params![
                    check_in.worker_id,
                    format_ts(&check_in.timestamp),
                    check_in.location.lat,
                    check_in.location.lng,
                    check_in.location.accuracy_m,
                    check_in.note
                ],
            )
            .map_err(|err| format!("Failed to insert check-in: {}", err))?;
            conn.execute(
                "DELETE FROM check_ins WHERE worker_id = ?1 AND timestamp NOT IN ( \
                    SELECT timestamp FROM check_ins WHERE worker_id = ?1 \
                    ORDER BY timestamp DESC LIMIT ?2)",
                params![check_in.worker_id, CHECK_IN_RETENTION],
            )
            .map_err(|err| format!("Failed to trim check-ins: {}", err))?;
            Ok(())
        })
    }

    pub fn list_check_ins(&self) -> Result<Vec<CheckIn>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT worker_id, timestamp, lat, lng, accuracy_m, note \
                     FROM check_ins ORDER BY timestamp ASC",
                )
                .map_err(|err| format!("Failed to prepare check-ins query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })
                .map_err(|err| format!("Failed to read check-in rows: {}", err))?;

            let mut check_ins = Vec::new();
            for row in rows {
                let (worker_id, timestamp, lat, lng, accuracy_m, note) =
                    row.map_err(|err| format!("Failed to decode check-in row: {}", err))?;
                let Some(timestamp) = parse_rfc3339(timestamp) else {
                    tracing::warn!(worker_id = %worker_id, "Skipping check-in with bad timestamp");
                    continue;
                };
                check_ins.push(CheckIn {
                    worker_id,
                    timestamp,
                    location: GeoPoint { lat, lng, accuracy_m },
                    note,
                });
            }
            Ok(check_ins)
        })
    }

    pub fn insert_location(&self, sample: &LocationSample) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO locations (worker_id, sampled_at, lat, lng, accuracy_m, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(worker_id, sampled_at) DO NOTHING",
                params![
                    sample.worker_id,
                    format_ts(&sample.sampled_at),
                    sample.lat,
                    sample.lng,
                    sample.accuracy_m,
                    format_ts(&sample.received_at)
                ],
            )
            .map_err(|err| format!("Failed to insert location: {}", err))?;
            conn.execute(
                "DELETE FROM locations WHERE worker_id = ?1 AND sampled_at NOT IN ( \
                    SELECT sampled_at FROM locations WHERE worker_id = ?1 \
                    ORDER BY sampled_at DESC LIMIT ?2)",
                params![sample.worker_id, self.location_retention],
            )
            .map_err(|err| format!("Failed to trim locations: {}", err))?;
            Ok(())
        })
    }

    pub fn list_locations(&self) -> Result<Vec<LocationSample>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT worker_id, sampled_at, lat, lng, accuracy_m, received_at \
                     FROM locations ORDER BY sampled_at ASC",
                )
                .map_err(|err| format!("Failed to prepare locations query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|err| format!("Failed to read location rows: {}", err))?;

            let mut samples = Vec::new();
            for row in rows {
                let (worker_id, sampled_at, lat, lng, accuracy_m, received_at) =
                    row.map_err(|err| format!("Failed to decode location row: {}", err))?;
                let (Some(sampled_at), Some(received_at)) =
                    (parse_rfc3339(sampled_at), parse_rfc3339(received_at))
                else {
                    tracing::warn!(worker_id = %worker_id, "Skipping location with bad timestamp");
                    continue;
                };
                samples.push(LocationSample {
                    worker_id,
                    lat,
                    lng,
                    accuracy_m,
                    sampled_at,
                    received_at,
                });
            }
            Ok(samples)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Compliance and alerts
    // ─────────────────────────────────────────────────────────────────────

    pub fn upsert_compliance(
        &self,
        worker_id: &str,
        state: ComplianceState,
        changed_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO compliance (worker_id, state, changed_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(worker_id) DO UPDATE SET \
                    state = excluded.state, \
                    changed_at = excluded.changed_at \
                 WHERE excluded.changed_at >= compliance.changed_at",
                params![worker_id, state.as_str(), format_ts(&changed_at)],
            )
            .map_err(|err| format!("Failed to upsert compliance: {}", err))?;
            Ok(())
        })
    }

    pub fn list_compliance(&self) -> Result<Vec<ComplianceRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT worker_id, state, changed_at FROM compliance ORDER BY worker_id")
                .map_err(|err| format!("Failed to prepare compliance query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| format!("Failed to read compliance rows: {}", err))?;

            let mut entries = Vec::new();
            for row in rows {
                let (worker_id, state, changed_at) =
                    row.map_err(|err| format!("Failed to decode compliance row: {}", err))?;
                match (ComplianceState::from_str(&state), parse_rfc3339(changed_at)) {
                    (Some(state), Some(changed_at)) => entries.push(ComplianceRow {
                        worker_id,
                        state,
                        changed_at,
                    }),
                    _ => {
                        tracing::warn!(worker_id = %worker_id, state = %state, "Skipping malformed compliance row");
                    }
                }
            }
            Ok(entries)
        })
    }

    pub fn upsert_alert(&self, alert: &Alert) -> Result<(), String> {
        let payload = serde_json::to_string(alert)
            .map_err(|err| format!("Failed to serialize alert: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO alerts (id, worker_id, kind, status, updated_at, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET \
                    status = excluded.status, \
                    updated_at = excluded.updated_at, \
                    payload = excluded.payload \
                 WHERE excluded.updated_at >= alerts.updated_at",
                params![
                    alert.id,
                    alert.worker_id,
                    alert.kind.as_str(),
                    alert.status.as_str(),
                    format_ts(&alert.updated_at),
                    payload
                ],
            )
            .map_err(|err| format!("Failed to upsert alert: {}", err))?;
            Ok(())
        })
    }

    pub fn list_alerts(&self) -> Result<Vec<Alert>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM alerts ORDER BY updated_at ASC, id ASC")
                .map_err(|err| format!("Failed to prepare alerts query: {}", err))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| format!("Failed to read alert rows: {}", err))?;

            let mut alerts = Vec::new();
            for row in rows {
                let payload = row.map_err(|err| format!("Failed to decode alert row: {}", err))?;
                let alert: Alert = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse alert payload: {}", err))?;
                alerts.push(alert);
            }
            Ok(alerts)
        })
    }

    pub fn alert_status(&self, alert_id: &str) -> Result<Option<String>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT status FROM alerts WHERE id = ?1",
                params![alert_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| format!("Failed to query alert status: {}", err))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messaging
    // ─────────────────────────────────────────────────────────────────────

    /// Writes a conversation and its messages in one transaction.
    pub fn save_conversation(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> Result<(), String> {
        let conversation_payload = serde_json::to_string(conversation)
            .map_err(|err| format!("Failed to serialize conversation: {}", err))?;
        let mut message_payloads = Vec::with_capacity(messages.len());
        for message in messages {
            let payload = serde_json::to_string(message)
                .map_err(|err| format!("Failed to serialize message: {}", err))?;
            message_payloads.push((message, payload));
        }

        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start transaction: {}", err))?;
            tx.execute(
                "INSERT INTO conversations (id, payload) VALUES (?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                params![conversation.id, conversation_payload],
            )
            .map_err(|err| format!("Failed to upsert conversation: {}", err))?;
            for (message, payload) in &message_payloads {
                tx.execute(
                    "INSERT INTO messages (id, conversation_id, sent_at, seq, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                    params![
                        message.id,
                        message.conversation_id,
                        format_ts(&message.sent_at),
                        message.seq as i64,
                        payload
                    ],
                )
                .map_err(|err| format!("Failed to upsert message: {}", err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit conversation: {}", err))
        })
    }

    pub fn list_conversations(&self) -> Result<Vec<(Conversation, Vec<Message>)>, String> {
        self.with_connection(|conn| {
            let mut conversations = Vec::new();
            {
                let mut stmt = conn
                    .prepare("SELECT payload FROM conversations ORDER BY id ASC")
                    .map_err(|err| format!("Failed to prepare conversations query: {}", err))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|err| format!("Failed to read conversation rows: {}", err))?;
                for row in rows {
                    let payload =
                        row.map_err(|err| format!("Failed to decode conversation row: {}", err))?;
                    let conversation: Conversation = serde_json::from_str(&payload)
                        .map_err(|err| format!("Failed to parse conversation payload: {}", err))?;
                    conversations.push(conversation);
                }
            }

            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM messages WHERE conversation_id = ?1 \
                     ORDER BY sent_at ASC, seq ASC",
                )
                .map_err(|err| format!("Failed to prepare messages query: {}", err))?;
            let mut threads = Vec::with_capacity(conversations.len());
            for conversation in conversations {
                let rows = stmt
                    .query_map(params![conversation.id], |row| row.get::<_, String>(0))
                    .map_err(|err| format!("Failed to read message rows: {}", err))?;
                let mut messages = Vec::new();
                for row in rows {
                    let payload =
                        row.map_err(|err| format!("Failed to decode message row: {}", err))?;
                    let message: Message = serde_json::from_str(&payload)
                        .map_err(|err| format!("Failed to parse message payload: {}", err))?;
                    messages.push(message);
                }
                threads.push((conversation, messages));
            }
            Ok(threads)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS workers (
                    worker_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    department TEXT NOT NULL,
                    activity TEXT
                 );
                 CREATE TABLE IF NOT EXISTS check_ins (
                    worker_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    lat REAL NOT NULL,
                    lng REAL NOT NULL,
                    accuracy_m REAL,
                    note TEXT,
                    PRIMARY KEY (worker_id, timestamp)
                 );
                 CREATE TABLE IF NOT EXISTS locations (
                    worker_id TEXT NOT NULL,
                    sampled_at TEXT NOT NULL,
                    lat REAL NOT NULL,
                    lng REAL NOT NULL,
                    accuracy_m REAL NOT NULL,
                    received_at TEXT NOT NULL,
                    PRIMARY KEY (worker_id, sampled_at)
                 );
                 CREATE TABLE IF NOT EXISTS compliance (
                    worker_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    changed_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS alerts (
                    id TEXT PRIMARY KEY,
                    worker_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS alerts_worker_idx ON alerts (worker_id, status);
                 CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    sent_at TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS messages_conversation_idx
                    ON messages (conversation_id, sent_at, seq);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

/// Persists alert and compliance events from the notification feed.
///
/// Errors become `DeliveryFailure`s, so the dispatcher retries with backoff.
pub struct FeedStoreSink {
    db: Arc<Db>,
}

impl FeedStoreSink {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl NotificationSink for FeedStoreSink {
    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryFailure> {
        let result = match event {
            FeedEvent::AlertRaised { alert }
            | FeedEvent::AlertUpdated { alert }
            | FeedEvent::AlertEscalated { alert } => self.db.upsert_alert(alert),
            FeedEvent::ComplianceChanged { worker_id, to, at, .. } => {
                self.db.upsert_compliance(worker_id, *to, *at)
            }
            FeedEvent::AlertSnapshot { .. } => Ok(()),
        };
        result.map_err(|err| DeliveryFailure::new(err))
    }
}

/// Fixed-width UTC so text comparison in SQL matches time order.
fn format_ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(value: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use fieldwatch_core::{
        ActivityType, AlertKind, AlertStatus, ConversationKind, MessagingStore,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn db(retention: usize) -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db"), retention).expect("db init");
        (temp_dir, db)
    }

    fn alert(status: AlertStatus, updated_at: DateTime<Utc>) -> Alert {
        Alert {
            id: "alert-1".to_string(),
            worker_id: "w-1".to_string(),
            kind: AlertKind::MissedCheckin,
            status,
            created_at: t0(),
            updated_at,
            last_escalated_at: None,
            escalation_count: 0,
            message: "Missed scheduled check-in.".to_string(),
            location: None,
            trigger_state: ComplianceState::Overdue,
            resolved_at: None,
        }
    }

    #[test]
    fn workers_round_trip_with_activity() {
        let (_dir, db) = db(10);
        let mut worker = Worker::new("w-1", "Lee Park", "Surveyor", "Roads");
        worker.activity = Some(ScheduledActivity::new(
            "act-1",
            ActivityType::Assessment,
            t0(),
            t0() + Duration::hours(2),
        ));
        db.upsert_worker(&worker).expect("upsert");

        let workers = db.list_workers().expect("list");
        assert_eq!(workers, vec![worker]);

        db.delete_worker("w-1").expect("delete");
        assert!(db.list_workers().expect("list").is_empty());
    }

    #[test]
    fn locations_are_trimmed_to_retention() {
        let (_dir, db) = db(2);
        for minute in 0..4 {
            let at = t0() + Duration::minutes(minute);
            db.insert_location(&LocationSample {
                worker_id: "w-1".to_string(),
                lat: -37.8,
                lng: 144.9,
                accuracy_m: 5.0,
                sampled_at: at,
                received_at: at,
            })
            .expect("insert");
        }
        let samples = db.list_locations().expect("list");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sampled_at, t0() + Duration::minutes(2));
    }

    #[test]
    fn check_ins_ignore_replays() {
        let (_dir, db) = db(10);
        let check_in = CheckIn {
            worker_id: "w-1".to_string(),
            timestamp: t0(),
            location: GeoPoint::new(-37.8, 144.9),
            note: Some("gate 3".to_string()),
        };
        db.insert_check_in(&check_in).expect("insert");
        db.insert_check_in(&check_in).expect("replay");
        assert_eq!(db.list_check_ins().expect("list"), vec![check_in]);
    }

    #[test]
    fn alert_upsert_never_regresses() {
        let (_dir, db) = db(10);
        db.upsert_alert(&alert(AlertStatus::Resolved, t0() + Duration::minutes(5)))
            .expect("resolved");
        db.upsert_alert(&alert(AlertStatus::Active, t0()))
            .expect("late active");
        assert_eq!(
            db.alert_status("alert-1").expect("status").as_deref(),
            Some("resolved")
        );
        assert_eq!(db.list_alerts().expect("list").len(), 1);
    }

    #[test]
    fn feed_sink_persists_compliance_changes() {
        let (_dir, db) = db(10);
        let db = Arc::new(db);
        let sink = FeedStoreSink::new(Arc::clone(&db));
        sink.deliver(&FeedEvent::ComplianceChanged {
            worker_id: "w-1".to_string(),
            from: ComplianceState::OnSchedule,
            to: ComplianceState::Overdue,
            at: t0(),
        })
        .expect("deliver");

        let rows = db.list_compliance().expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, ComplianceState::Overdue);
    }

    #[test]
    fn conversations_round_trip() {
        let (_dir, db) = db(10);
        let store = MessagingStore::new();
        let conversation = store
            .create_conversation(
                ConversationKind::Direct,
                vec!["sup-1".to_string(), "w-1".to_string()],
                None,
                t0(),
            )
            .expect("create");
        store.send(&conversation.id, "sup-1", "Status?", t0()).expect("send");
        store
            .send(&conversation.id, "w-1", "Fine", t0() + Duration::seconds(3))
            .expect("send");

        let messages = store.list_messages(&conversation.id).expect("messages");
        let conversation = store.conversation(&conversation.id).expect("conversation");
        db.save_conversation(&conversation, &messages).expect("save");

        let threads = db.list_conversations().expect("load");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].0, conversation);
        assert_eq!(threads[0].1, messages);
    }
}
