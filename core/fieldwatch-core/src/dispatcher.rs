//! Notification fan-out.
//!
//! `publish` never waits on a sink: session events go into a bounded lock-free
//! queue that drops the oldest entry when full. A pump (the dispatcher thread,
//! or `flush` in tests) moves queued events into per-subscriber pending lists
//! and delivers them in order. A failing sink gets exponential backoff on its
//! own list, so it never holds up other subscribers or the publisher.
//!
//! Internal sinks (persistence) are durable: `publish` appends to their
//! pending list directly, nothing is dropped for them, and a failed delivery
//! is retried until it succeeds.
//!
//! Sinks are called with the subscriber table unlocked. The pump takes each
//! subscriber's due work out, delivers it, and merges what is left back.
//!
//! Delivery is at-least-once. Subscribers that reconnect are handed a backlog
//! of open alerts by the engine before any new events.

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{DispatcherConfig, NotificationConfig};
use crate::types::{Alert, AlertKind, ComplianceState, WorkerId};

const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    AlertRaised {
        alert: Alert,
    },
    AlertUpdated {
        alert: Alert,
    },
    AlertEscalated {
        alert: Alert,
    },
    /// Replayed open alert sent to a (re)connecting subscriber.
    AlertSnapshot {
        alert: Alert,
    },
    ComplianceChanged {
        worker_id: WorkerId,
        from: ComplianceState,
        to: ComplianceState,
        at: DateTime<Utc>,
    },
}

impl FeedEvent {
    pub fn alert(&self) -> Option<&Alert> {
        match self {
            FeedEvent::AlertRaised { alert }
            | FeedEvent::AlertUpdated { alert }
            | FeedEvent::AlertEscalated { alert }
            | FeedEvent::AlertSnapshot { alert } => Some(alert),
            FeedEvent::ComplianceChanged { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeedEvent::AlertRaised { .. } => "alert_raised",
            FeedEvent::AlertUpdated { .. } => "alert_updated",
            FeedEvent::AlertEscalated { .. } => "alert_escalated",
            FeedEvent::AlertSnapshot { .. } => "alert_snapshot",
            FeedEvent::ComplianceChanged { .. } => "compliance_changed",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryFailure {
    pub reason: String,
}

impl DeliveryFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A destination for feed events: a supervisor session, a persistence writer.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryFailure>;
}

/// Buffers events for clients that poll instead of holding a connection.
pub struct MailboxSink {
    events: ArrayQueue<FeedEvent>,
}

impl MailboxSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn drain(&self, max: usize) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.events.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl NotificationSink for MailboxSink {
    fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryFailure> {
        if let Some(displaced) = self.events.force_push(event.clone()) {
            tracing::warn!(
                dropped = displaced.label(),
                "Mailbox full; dropped oldest event"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub subscribers: usize,
    pub pending: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub abandoned: u64,
}

struct PendingDelivery {
    event: FeedEvent,
    attempts: u32,
    next_attempt: Instant,
}

struct Subscriber {
    sink: Arc<dyn NotificationSink>,
    pending: VecDeque<PendingDelivery>,
    /// Internal sinks see every event regardless of toggles, are fed directly
    /// by `publish`, and never drop or abandon an event.
    durable: bool,
    /// Distinguishes a re-subscription under the same id from the original.
    generation: u64,
    /// Set while a pump has this subscriber's pending list checked out.
    in_flight: bool,
}

/// Pending work checked out of the table for delivery without the lock.
struct Batch {
    id: String,
    generation: u64,
    sink: Arc<dyn NotificationSink>,
    durable: bool,
    pending: VecDeque<PendingDelivery>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    toggles: NotificationConfig,
    queue: ArrayQueue<FeedEvent>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    generations: AtomicU64,
    wake_lock: Mutex<bool>,
    wake: Condvar,
    shutdown: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(config: DispatcherConfig, toggles: NotificationConfig) -> Self {
        let queue = ArrayQueue::new(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                toggles,
                queue,
                subscribers: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                wake_lock: Mutex::new(false),
                wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the delivery thread. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(thread::spawn(move || inner.run()));
        tracing::info!("Notification dispatcher started");
    }

    /// Stops the delivery thread after draining whatever is queued.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!("Notification dispatcher thread panicked");
            }
        }
        self.inner.pump(Instant::now());
    }

    /// Enqueues an event without waiting on any sink.
    pub fn publish(&self, event: FeedEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        {
            let now = Instant::now();
            let mut subscribers = lock(&self.inner.subscribers);
            for subscriber in subscribers.values_mut().filter(|s| s.durable) {
                subscriber.pending.push_back(PendingDelivery {
                    event: event.clone(),
                    attempts: 0,
                    next_attempt: now,
                });
            }
        }
        if let Some(displaced) = self.inner.queue.force_push(event) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dropped = displaced.label(),
                capacity = self.inner.queue.capacity(),
                "Dispatch queue full; dropped oldest event"
            );
        }
        self.inner.notify();
    }

    /// Registers a supervisor session. `backlog` is delivered before new events.
    pub fn subscribe(
        &self,
        session_id: &str,
        sink: Arc<dyn NotificationSink>,
        backlog: Vec<FeedEvent>,
    ) {
        self.insert_subscriber(session_id, sink, backlog, false);
        tracing::info!(session_id = %session_id, "Supervisor session subscribed");
    }

    /// Registers a durable internal sink that receives every event.
    pub fn attach(&self, name: &str, sink: Arc<dyn NotificationSink>) {
        self.insert_subscriber(name, sink, Vec::new(), true);
        tracing::debug!(sink = %name, "Internal sink attached");
    }

    fn insert_subscriber(
        &self,
        id: &str,
        sink: Arc<dyn NotificationSink>,
        backlog: Vec<FeedEvent>,
        durable: bool,
    ) {
        let now = Instant::now();
        let pending = backlog
            .into_iter()
            .filter(|event| durable || self.inner.enabled(event))
            .map(|event| PendingDelivery {
                event,
                attempts: 0,
                next_attempt: now,
            })
            .collect();
        let subscriber = Subscriber {
            sink,
            pending,
            durable,
            generation: self.inner.generations.fetch_add(1, Ordering::Relaxed),
            in_flight: false,
        };
        lock(&self.inner.subscribers).insert(id.to_string(), subscriber);
        self.inner.notify();
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let removed = lock(&self.inner.subscribers).remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "Supervisor session unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        lock(&self.inner.subscribers).contains_key(session_id)
    }

    /// Delivers everything that is currently due, on the caller's thread.
    pub fn flush(&self) {
        self.inner.pump(Instant::now());
    }

    pub fn stats(&self) -> DispatcherStats {
        let subscribers = lock(&self.inner.subscribers);
        DispatcherStats {
            queued: self.inner.queue.len(),
            subscribers: subscribers.len(),
            pending: subscribers.values().map(|s| s.pending.len()).sum(),
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            abandoned: self.inner.abandoned.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify();
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

impl DispatcherInner {
    fn run(&self) {
        loop {
            let next_due = self.pump(Instant::now());
            if self.shutdown.load(Ordering::SeqCst) {
                self.pump(Instant::now());
                break;
            }
            let wait = next_due
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);
            let mut woken = lock(&self.wake_lock);
            if !*woken {
                woken = match self.wake.wait_timeout(woken, wait) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            *woken = false;
        }
        tracing::info!("Notification dispatcher stopped");
    }

    fn notify(&self) {
        *lock(&self.wake_lock) = true;
        self.wake.notify_one();
    }

    fn enabled(&self, event: &FeedEvent) -> bool {
        match event.alert().map(|alert| alert.kind) {
            Some(AlertKind::MissedCheckin) => self.toggles.missed_check_ins,
            Some(AlertKind::EmergencyPanic | AlertKind::EmergencySilent) => {
                self.toggles.emergency_alerts
            }
            None => true,
        }
    }

    /// Returns the earliest pending retry time, if any.
    fn pump(&self, now: Instant) -> Option<Instant> {
        let batches = self.check_out(now);

        let mut next_due: Option<Instant> = None;
        let mut delivered = Vec::with_capacity(batches.len());
        for mut batch in batches {
            if let Some(due) = self.deliver_due(&mut batch, now) {
                next_due = Some(next_due.map_or(due, |current| current.min(due)));
            }
            delivered.push(batch);
        }

        self.check_in(delivered);
        next_due
    }

    /// Fans queued events out and takes every idle subscriber's pending list.
    fn check_out(&self, now: Instant) -> Vec<Batch> {
        let mut subscribers = lock(&self.subscribers);

        while let Some(event) = self.queue.pop() {
            for (id, subscriber) in subscribers.iter_mut() {
                if subscriber.durable || !self.enabled(&event) {
                    continue;
                }
                if subscriber.pending.len() >= self.config.queue_capacity {
                    subscriber.pending.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscriber = %id, "Subscriber backlog full; dropped oldest");
                }
                subscriber.pending.push_back(PendingDelivery {
                    event: event.clone(),
                    attempts: 0,
                    next_attempt: now,
                });
            }
        }

        subscribers
            .iter_mut()
            .filter(|(_, subscriber)| !subscriber.in_flight && !subscriber.pending.is_empty())
            .map(|(id, subscriber)| {
                subscriber.in_flight = true;
                Batch {
                    id: id.clone(),
                    generation: subscriber.generation,
                    sink: Arc::clone(&subscriber.sink),
                    durable: subscriber.durable,
                    pending: std::mem::take(&mut subscriber.pending),
                }
            })
            .collect()
    }

    /// Puts undelivered work back ahead of anything published meanwhile.
    fn check_in(&self, batches: Vec<Batch>) {
        let mut subscribers = lock(&self.subscribers);
        for mut batch in batches {
            let Some(subscriber) = subscribers.get_mut(&batch.id) else {
                continue;
            };
            if subscriber.generation != batch.generation {
                continue;
            }
            batch.pending.append(&mut subscriber.pending);
            if !subscriber.durable {
                while batch.pending.len() > self.config.queue_capacity {
                    batch.pending.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            subscriber.pending = batch.pending;
            subscriber.in_flight = false;
        }
    }

    fn deliver_due(&self, batch: &mut Batch, now: Instant) -> Option<Instant> {
        let id = batch.id.as_str();
        while let Some(head) = batch.pending.front_mut() {
            if head.next_attempt > now {
                return Some(head.next_attempt);
            }
            match batch.sink.deliver(&head.event) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    batch.pending.pop_front();
                }
                Err(err) => {
                    head.attempts += 1;
                    let limit = self.config.max_delivery_attempts.max(1);
                    if !batch.durable && head.attempts >= limit {
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            subscriber = %id,
                            event = head.event.label(),
                            attempts = head.attempts,
                            error = %err,
                            "Giving up on event delivery"
                        );
                        batch.pending.pop_front();
                        continue;
                    }
                    let delay = retry_delay(&self.config, head.attempts);
                    head.next_attempt = now + delay;
                    if batch.durable && head.attempts >= limit {
                        tracing::error!(
                            subscriber = %id,
                            event = head.event.label(),
                            attempts = head.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "Durable sink still failing; will keep retrying"
                        );
                    } else {
                        tracing::warn!(
                            subscriber = %id,
                            event = head.event.label(),
                            attempts = head.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "Event delivery failed; will retry"
                        );
                    }
                    return Some(head.next_attempt);
                }
            }
        }
        None
    }
}

/// Exponential backoff: base * 2^(attempts-1), capped.
pub fn retry_delay(config: &DispatcherConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let delay_ms = config
        .retry_base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.retry_max_ms);
    Duration::from_millis(delay_ms)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, GeoPoint};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    struct RecordingSink {
        events: Mutex<Vec<FeedEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn labels(&self) -> Vec<&'static str> {
            lock(&self.events).iter().map(|e| e.label()).collect()
        }
    }

    impl NotificationSink for RecordingSink {
        fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryFailure> {
            lock(&self.events).push(event.clone());
            Ok(())
        }
    }

    struct FlakySink {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    impl NotificationSink for FlakySink {
        fn deliver(&self, _event: &FeedEvent) -> Result<(), DeliveryFailure> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DeliveryFailure::new("socket closed"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks inside its first delivery until released.
    struct GateSink {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
        events: Mutex<Vec<&'static str>>,
    }

    impl NotificationSink for GateSink {
        fn deliver(&self, event: &FeedEvent) -> Result<(), DeliveryFailure> {
            if let Some(entered) = lock(&self.entered).take() {
                let _ = entered.send(());
                let _ = lock(&self.release).recv();
            }
            lock(&self.events).push(event.label());
            Ok(())
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: 4,
            mailbox_capacity: 4,
            max_delivery_attempts: 3,
            retry_base_ms: 0,
            retry_max_ms: 0,
        }
    }

    fn alert(kind: AlertKind) -> Alert {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        Alert {
            id: "alert-1".to_string(),
            worker_id: "w-1".to_string(),
            kind,
            status: AlertStatus::Active,
            created_at: at,
            updated_at: at,
            last_escalated_at: None,
            escalation_count: 0,
            message: "test".to_string(),
            location: Some(GeoPoint::new(-37.8, 144.9)),
            trigger_state: ComplianceState::Overdue,
            resolved_at: None,
        }
    }

    fn change() -> FeedEvent {
        FeedEvent::ComplianceChanged {
            worker_id: "w-1".to_string(),
            from: ComplianceState::OnSchedule,
            to: ComplianceState::DueSoon,
            at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn delivers_to_every_subscriber() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        dispatcher.subscribe("a", a.clone(), Vec::new());
        dispatcher.subscribe("b", b.clone(), Vec::new());

        dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert(AlertKind::MissedCheckin),
        });
        dispatcher.flush();

        assert_eq!(a.labels(), vec!["alert_raised"]);
        assert_eq!(b.labels(), vec!["alert_raised"]);
    }

    #[test]
    fn backlog_precedes_new_events() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let sink = RecordingSink::new();
        dispatcher.publish(change());
        dispatcher.subscribe(
            "s",
            sink.clone(),
            vec![FeedEvent::AlertSnapshot {
                alert: alert(AlertKind::EmergencyPanic),
            }],
        );
        dispatcher.flush();
        assert_eq!(sink.labels(), vec!["alert_snapshot", "compliance_changed"]);
    }

    #[test]
    fn failing_subscriber_does_not_block_others() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let flaky = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(1),
            delivered: AtomicUsize::new(0),
        });
        let healthy = RecordingSink::new();
        dispatcher.subscribe("flaky", flaky.clone(), Vec::new());
        dispatcher.subscribe("healthy", healthy.clone(), Vec::new());

        dispatcher.publish(change());
        dispatcher.flush();
        assert_eq!(healthy.labels().len(), 1);
        assert_eq!(flaky.delivered.load(Ordering::SeqCst), 0);

        dispatcher.flush();
        assert_eq!(flaky.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().pending, 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let flaky = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(100),
            delivered: AtomicUsize::new(0),
        });
        dispatcher.subscribe("flaky", flaky, Vec::new());
        dispatcher.publish(change());
        for _ in 0..3 {
            dispatcher.flush();
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let sink = RecordingSink::new();
        dispatcher.subscribe("s", sink.clone(), Vec::new());
        dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert(AlertKind::MissedCheckin),
        });
        for _ in 0..4 {
            dispatcher.publish(change());
        }
        assert_eq!(dispatcher.stats().dropped, 1);
        dispatcher.flush();
        assert_eq!(sink.labels(), vec!["compliance_changed"; 4]);
    }

    #[test]
    fn toggles_filter_sessions_but_not_internal_sinks() {
        let toggles = NotificationConfig {
            emergency_alerts: true,
            missed_check_ins: false,
        };
        let dispatcher = NotificationDispatcher::new(config(), toggles);
        let session = RecordingSink::new();
        let store = RecordingSink::new();
        dispatcher.subscribe("session", session.clone(), Vec::new());
        dispatcher.attach("store", store.clone());

        dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert(AlertKind::MissedCheckin),
        });
        dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert(AlertKind::EmergencySilent),
        });
        dispatcher.flush();

        assert_eq!(session.labels().len(), 1);
        assert_eq!(store.labels().len(), 2);
    }

    #[test]
    fn internal_sink_keeps_events_the_queue_dropped() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let session = RecordingSink::new();
        let store = RecordingSink::new();
        dispatcher.subscribe("session", session.clone(), Vec::new());
        dispatcher.attach("store", store.clone());

        for _ in 0..6 {
            dispatcher.publish(FeedEvent::AlertRaised {
                alert: alert(AlertKind::EmergencyPanic),
            });
        }
        dispatcher.flush();

        assert_eq!(session.labels().len(), 4);
        assert_eq!(store.labels().len(), 6);
        assert_eq!(dispatcher.stats().dropped, 2);
    }

    #[test]
    fn internal_sink_is_retried_past_the_attempt_limit() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let store = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(10),
            delivered: AtomicUsize::new(0),
        });
        dispatcher.attach("store", store.clone());
        dispatcher.publish(change());

        for _ in 0..11 {
            dispatcher.flush();
        }
        assert_eq!(store.delivered.load(Ordering::SeqCst), 1);
        let stats = dispatcher.stats();
        assert_eq!(stats.abandoned, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn slow_sink_does_not_hold_the_subscriber_table() {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            config(),
            NotificationConfig::default(),
        ));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(GateSink {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
            events: Mutex::new(Vec::new()),
        });
        dispatcher.subscribe("slow", gate.clone(), Vec::new());
        dispatcher.publish(change());

        let pumping = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.flush())
        };
        entered_rx.recv().expect("sink entered");

        let late = RecordingSink::new();
        dispatcher.subscribe("late", late.clone(), Vec::new());
        assert_eq!(dispatcher.stats().subscribers, 2);
        dispatcher.publish(FeedEvent::AlertRaised {
            alert: alert(AlertKind::MissedCheckin),
        });

        release_tx.send(()).expect("release");
        pumping.join().expect("join");
        dispatcher.flush();

        assert_eq!(
            *lock(&gate.events),
            vec!["compliance_changed", "alert_raised"]
        );
        assert_eq!(late.labels(), vec!["alert_raised"]);
    }

    #[test]
    fn feed_events_are_tagged_on_the_wire() {
        let value = serde_json::to_value(change()).expect("serialize");
        assert_eq!(value["type"], "compliance_changed");
        assert_eq!(value["to"], "due_soon");
    }

    #[test]
    fn mailbox_keeps_newest() {
        let mailbox = MailboxSink::new(2);
        for _ in 0..3 {
            mailbox.deliver(&change()).expect("deliver");
        }
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.drain(10).len(), 2);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let config = DispatcherConfig {
            retry_base_ms: 100,
            retry_max_ms: 1000,
            ..DispatcherConfig::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(&config, 10), Duration::from_millis(1000));
    }

    #[test]
    fn background_thread_delivers_and_stops() {
        let dispatcher = NotificationDispatcher::new(config(), NotificationConfig::default());
        let sink = RecordingSink::new();
        dispatcher.subscribe("s", sink.clone(), Vec::new());
        dispatcher.start();
        dispatcher.publish(change());
        dispatcher.shutdown();
        assert_eq!(sink.labels(), vec!["compliance_changed"]);
    }
}
