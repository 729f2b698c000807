//! # fieldwatch-core
//!
//! Safety monitoring for lone field workers: location ingestion, check-in
//! cadence, the per-worker compliance state machine, alert lifecycle,
//! notification fan-out and supervisor/worker messaging.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Background work runs on plain threads.
//! - **Thread-safe**: Every component is `Send + Sync`; callers share one
//!   `Arc<FieldwatchEngine>` across connection threads.
//! - **Per-worker serialization**: Work for one worker is ordered; different
//!   workers proceed in parallel.
//! - **Explicit time**: Operations take `now` rather than reading the clock.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fieldwatch_core::{FieldwatchConfig, FieldwatchEngine, Worker};
//!
//! let engine = FieldwatchEngine::new(FieldwatchConfig::default());
//! engine.register_worker(Worker::new("w-1", "Ana Reyes", "Arborist", "Parks"))?;
//! engine.start();
//! let team = engine.team_status(chrono::Utc::now());
//! ```

pub mod alerts;
pub mod compliance;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod location;
pub mod messaging;
pub mod registry;
pub mod scheduler;
pub mod ticker;
pub mod types;

pub use alerts::{AlertFilter, AlertManager, TransitionContext};
pub use compliance::{
    ComplianceMonitor, ComplianceSnapshot, EmergencyOutcome, EmergencyReport, TickReport,
    Transition,
};
pub use config::{load_config, FieldwatchConfig};
pub use dispatcher::{
    DeliveryFailure, DispatcherStats, FeedEvent, MailboxSink, NotificationDispatcher,
    NotificationSink,
};
pub use engine::{
    CheckInReceipt, EmergencyReceipt, EngineTick, FieldwatchEngine, StateCounts, TeamStatus,
    WorkerStatus,
};
pub use error::{FieldwatchError, Result};
pub use location::{LocationIngestor, LocationOutcome};
pub use messaging::{Conversation, ConversationKind, ConversationSummary, Message, MessagingStore};
pub use registry::WorkerRegistry;
pub use scheduler::{classify, required_interval, CheckInOutcome, CheckInSchedule, CheckInScheduler};
pub use ticker::ComplianceTicker;
pub use types::*;
