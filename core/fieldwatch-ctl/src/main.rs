//! fieldwatch-ctl: command-line client for the Fieldwatch daemon.
//!
//! Used by field apps' test harnesses and by supervisors at a terminal.
//! Every subcommand maps to one daemon method and prints the response data
//! as JSON on stdout.
//!
//! ## Subcommands
//!
//! - Workers: `register`, `deactivate`, `assign`
//! - Ingress: `location`, `check-in`, `emergency`, `resolve-emergency`
//! - Supervision: `status`, `team`, `history`, `alerts`, `ack`, `resolve`
//! - Messaging: `message-worker`, `conversation`, `send`, `read`, `conversations`, `messages`
//! - Feed: `watch`

mod daemon_client;
mod logging;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fieldwatch_daemon_protocol::{
    ActivityParams, AlertParams, AlertStatusFilter, AssignActivityParams, ConversationKindParam,
    ConversationParams, CreateConversationParams, EmergencyKindParam, EmptyParams,
    ListAlertsParams, ListConversationsParams, MarkReadParams, MessageWorkerParams, Method,
    PollFeedParams, RegisterWorkerParams, SendMessageParams, SessionParams, SubmitCheckInParams,
    SubmitEmergencyParams, SubmitLocationParams, WorkerParams,
};
use serde::Serialize;
use serde_json::Value;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fieldwatch-ctl")]
#[command(about = "Fieldwatch worker safety daemon client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,

    /// Register a worker, optionally with a scheduled activity
    Register {
        #[arg(long)]
        worker_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        role: String,
        #[arg(long, default_value = "")]
        department: String,
        #[command(flatten)]
        activity: ActivityArgs,
    },

    /// Remove a worker and resolve their open alerts
    Deactivate { worker_id: String },

    /// Replace (or clear) a worker's scheduled activity
    Assign {
        worker_id: String,
        #[command(flatten)]
        activity: ActivityArgs,
    },

    /// Submit a GPS fix
    Location {
        worker_id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        /// Reported accuracy in meters
        #[arg(long)]
        accuracy: f64,
        /// RFC3339 sample time (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Record a safety check-in
    CheckIn {
        worker_id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long)]
        accuracy: Option<f64>,
        #[arg(long)]
        note: Option<String>,
        /// RFC3339 check-in time (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Press the panic or silent duress button
    Emergency {
        worker_id: String,
        #[arg(long, value_enum, default_value_t = EmergencyArg::Panic)]
        kind: EmergencyArg,
        #[arg(long, allow_hyphen_values = true, requires = "lng")]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lng: Option<f64>,
        #[arg(long)]
        accuracy: Option<f64>,
        #[arg(long)]
        at: Option<String>,
    },

    /// Take a worker out of emergency
    ResolveEmergency { worker_id: String },

    /// Show one worker's compliance, schedule and open alerts
    Status { worker_id: String },

    /// Show every worker, most urgent first
    Team,

    /// Show a worker's recent location samples
    History { worker_id: String },

    /// List alerts
    Alerts {
        #[arg(long, value_enum, default_value_t = StatusArg::All)]
        status: StatusArg,
        /// missed_checkin | emergency_panic | emergency_silent
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Acknowledge an alert
    Ack { alert_id: String },

    /// Resolve an alert
    Resolve { alert_id: String },

    /// Message the worker behind an alert
    MessageWorker {
        alert_id: String,
        #[arg(long = "from")]
        sender_id: String,
        content: String,
    },

    /// Create a direct or group conversation
    Conversation {
        #[arg(long, value_enum, default_value_t = ConversationArg::Direct)]
        kind: ConversationArg,
        /// Participant ids (repeat the flag)
        #[arg(long = "participant", required = true)]
        participants: Vec<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Send a message to a conversation
    Send {
        conversation_id: String,
        #[arg(long = "from")]
        sender_id: String,
        content: String,
    },

    /// Mark a conversation read for a participant
    Read {
        conversation_id: String,
        #[arg(long = "reader")]
        reader_id: String,
    },

    /// List a participant's conversations with unread counts
    Conversations { participant_id: String },

    /// List a conversation's messages in order
    Messages { conversation_id: String },

    /// Subscribe a supervisor session and print feed events as JSON lines
    Watch {
        #[arg(long)]
        session_id: String,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long)]
        max_events: Option<usize>,
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Args, Default)]
struct ActivityArgs {
    #[arg(long, requires_all = ["start", "end"])]
    activity_id: Option<String>,
    /// inspection | maintenance | assessment | other
    #[arg(long, default_value = "other")]
    activity_type: String,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    site: Option<String>,
}

impl ActivityArgs {
    fn into_params(self) -> Option<ActivityParams> {
        let activity_id = self.activity_id?;
        Some(ActivityParams {
            activity_id,
            activity_type: self.activity_type,
            start: self.start.unwrap_or_default(),
            end: self.end.unwrap_or_default(),
            title: self.title,
            site: self.site,
        })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EmergencyArg {
    Panic,
    Silent,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    All,
    Open,
    Active,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConversationArg {
    Direct,
    Group,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(Some(data)) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                tracing::error!(error = %err, "Failed to render daemon response");
                std::process::exit(1);
            }
        },
        Ok(None) => {}
        Err(err) => {
            tracing::error!(error = %err, "fieldwatch-ctl command failed");
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(command: Commands) -> Result<Option<Value>, String> {
    let (method, params) = match command {
        Commands::Health => (Method::GetHealth, to_params(&EmptyParams {})?),
        Commands::Register {
            worker_id,
            name,
            role,
            department,
            activity,
        } => (
            Method::RegisterWorker,
            to_params(&RegisterWorkerParams {
                worker_id,
                name,
                role,
                department,
                activity: activity.into_params(),
            })?,
        ),
        Commands::Deactivate { worker_id } => {
            (Method::DeactivateWorker, to_params(&WorkerParams { worker_id })?)
        }
        Commands::Assign {
            worker_id,
            activity,
        } => (
            Method::AssignActivity,
            to_params(&AssignActivityParams {
                worker_id,
                activity: activity.into_params(),
            })?,
        ),
        Commands::Location {
            worker_id,
            lat,
            lng,
            accuracy,
            at,
        } => (
            Method::SubmitLocation,
            to_params(&SubmitLocationParams {
                worker_id,
                lat,
                lng,
                accuracy_m: accuracy,
                sampled_at: timestamp_or_now(at),
            })?,
        ),
        Commands::CheckIn {
            worker_id,
            lat,
            lng,
            accuracy,
            note,
            at,
        } => (
            Method::SubmitCheckIn,
            to_params(&SubmitCheckInParams {
                worker_id,
                timestamp: timestamp_or_now(at),
                lat,
                lng,
                accuracy_m: accuracy,
                note,
            })?,
        ),
        Commands::Emergency {
            worker_id,
            kind,
            lat,
            lng,
            accuracy,
            at,
        } => (
            Method::SubmitEmergency,
            to_params(&SubmitEmergencyParams {
                worker_id,
                kind: match kind {
                    EmergencyArg::Panic => EmergencyKindParam::Panic,
                    EmergencyArg::Silent => EmergencyKindParam::Silent,
                },
                timestamp: timestamp_or_now(at),
                lat,
                lng,
                accuracy_m: accuracy,
            })?,
        ),
        Commands::ResolveEmergency { worker_id } => {
            (Method::ResolveEmergency, to_params(&WorkerParams { worker_id })?)
        }
        Commands::Status { worker_id } => {
            (Method::GetWorkerStatus, to_params(&WorkerParams { worker_id })?)
        }
        Commands::Team => (Method::GetTeamStatus, to_params(&EmptyParams {})?),
        Commands::History { worker_id } => {
            (Method::GetLocationHistory, to_params(&WorkerParams { worker_id })?)
        }
        Commands::Alerts {
            status,
            kind,
            worker_id,
        } => (
            Method::ListAlerts,
            to_params(&ListAlertsParams {
                status: match status {
                    StatusArg::All => AlertStatusFilter::All,
                    StatusArg::Open => AlertStatusFilter::Open,
                    StatusArg::Active => AlertStatusFilter::Active,
                },
                kind,
                worker_id,
            })?,
        ),
        Commands::Ack { alert_id } => {
            (Method::AcknowledgeAlert, to_params(&AlertParams { alert_id })?)
        }
        Commands::Resolve { alert_id } => {
            (Method::ResolveAlert, to_params(&AlertParams { alert_id })?)
        }
        Commands::MessageWorker {
            alert_id,
            sender_id,
            content,
        } => (
            Method::MessageWorker,
            to_params(&MessageWorkerParams {
                alert_id,
                sender_id,
                content,
            })?,
        ),
        Commands::Conversation {
            kind,
            participants,
            name,
        } => (
            Method::CreateConversation,
            to_params(&CreateConversationParams {
                kind: match kind {
                    ConversationArg::Direct => ConversationKindParam::Direct,
                    ConversationArg::Group => ConversationKindParam::Group,
                },
                participants,
                name,
            })?,
        ),
        Commands::Send {
            conversation_id,
            sender_id,
            content,
        } => (
            Method::SendMessage,
            to_params(&SendMessageParams {
                conversation_id,
                sender_id,
                content,
            })?,
        ),
        Commands::Read {
            conversation_id,
            reader_id,
        } => (
            Method::MarkRead,
            to_params(&MarkReadParams {
                conversation_id,
                reader_id,
            })?,
        ),
        Commands::Conversations { participant_id } => (
            Method::ListConversations,
            to_params(&ListConversationsParams { participant_id })?,
        ),
        Commands::Messages { conversation_id } => (
            Method::ListMessages,
            to_params(&ConversationParams { conversation_id })?,
        ),
        Commands::Watch {
            session_id,
            interval_ms,
            max_events,
            once,
        } => {
            watch(session_id, interval_ms, max_events, once)?;
            return Ok(None);
        }
    };

    daemon_client::call(method, params)
        .map(Some)
        .map_err(|err| err.to_string())
}

/// Subscribes, then polls until interrupted. With `--once` it polls a single
/// time and unsubscribes.
fn watch(
    session_id: String,
    interval_ms: u64,
    max_events: Option<usize>,
    once: bool,
) -> Result<(), String> {
    let subscribed = daemon_client::call(
        Method::Subscribe,
        to_params(&SessionParams {
            session_id: session_id.clone(),
        })?,
    )
    .map_err(|err| err.to_string())?;
    tracing::info!(session_id = %session_id, backlog = %subscribed["backlog"], "Watching feed");

    let poll = to_params(&PollFeedParams {
        session_id: session_id.clone(),
        max_events,
    })?;
    loop {
        let events = daemon_client::call(Method::PollFeed, poll.clone()).map_err(|err| err.to_string())?;
        for event in events.as_array().into_iter().flatten() {
            println!("{}", event);
        }
        if once {
            daemon_client::call(Method::Unsubscribe, to_params(&SessionParams { session_id })?)
                .map_err(|err| err.to_string())?;
            return Ok(());
        }
        thread::sleep(Duration::from_millis(interval_ms.max(50)));
    }
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, String> {
    serde_json::to_value(params).map_err(|err| format!("Failed to encode params: {}", err))
}

fn timestamp_or_now(at: Option<String>) -> String {
    at.unwrap_or_else(|| Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn activity_args_need_an_id() {
        assert!(ActivityArgs::default().into_params().is_none());

        let args = ActivityArgs {
            activity_id: Some("act-1".to_string()),
            activity_type: "inspection".to_string(),
            start: Some("2026-03-02T09:00:00Z".to_string()),
            end: Some("2026-03-02T17:00:00Z".to_string()),
            ..ActivityArgs::default()
        };
        let params = args.into_params().expect("activity");
        assert_eq!(params.activity_type, "inspection");
        assert_eq!(params.end, "2026-03-02T17:00:00Z");
    }

    #[test]
    fn check_in_parses_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "fieldwatch-ctl",
            "check-in",
            "w-1",
            "--lat",
            "-41.29",
            "--lng",
            "174.78",
        ])
        .expect("parse");
        match cli.command {
            Commands::CheckIn { lat, lng, .. } => {
                assert_eq!(lat, -41.29);
                assert_eq!(lng, 174.78);
            }
            _ => panic!("expected check-in"),
        }
    }
}
