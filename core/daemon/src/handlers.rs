//! Request dispatch: one function per protocol method.
//!
//! Handlers decode params with the shared protocol types, call into
//! `SharedState`, and map engine errors onto their wire codes.

use chrono::Utc;
use fieldwatch_core::{
    ActivityType, AlertFilter, AlertKind, CheckIn, ConversationKind, EmergencyKind,
    FieldwatchError, GeoPoint, ScheduledActivity, Worker,
};
use fieldwatch_daemon_protocol::{
    parse_params, parse_timestamp, ActivityParams, AlertParams, AlertStatusFilter,
    AssignActivityParams, ConversationKindParam, ConversationParams, CreateConversationParams,
    EmergencyKindParam, EmptyParams, ErrorInfo, ListAlertsParams, ListConversationsParams,
    MarkReadParams, MessageWorkerParams, Method, PollFeedParams, RegisterWorkerParams, Request,
    Response, SendMessageParams, SessionParams, SubmitCheckInParams, SubmitEmergencyParams,
    SubmitLocationParams, WorkerParams, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::SharedState;

pub fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    let result = match request.method {
        Method::GetHealth => get_health(&state),
        Method::RegisterWorker => register_worker(&state, params),
        Method::DeactivateWorker => deactivate_worker(&state, params),
        Method::AssignActivity => assign_activity(&state, params),
        Method::SubmitLocation => submit_location(&state, params),
        Method::SubmitCheckIn => submit_check_in(&state, params),
        Method::SubmitEmergency => submit_emergency(&state, params),
        Method::ResolveEmergency => resolve_emergency(&state, params),
        Method::GetWorkerStatus => get_worker_status(&state, params),
        Method::GetTeamStatus => get_team_status(&state, params),
        Method::GetLocationHistory => get_location_history(&state, params),
        Method::ListAlerts => list_alerts(&state, params),
        Method::AcknowledgeAlert => acknowledge_alert(&state, params),
        Method::ResolveAlert => resolve_alert(&state, params),
        Method::MessageWorker => message_worker(&state, params),
        Method::CreateConversation => create_conversation(&state, params),
        Method::SendMessage => send_message(&state, params),
        Method::MarkRead => mark_read(&state, params),
        Method::ListConversations => list_conversations(&state, params),
        Method::ListMessages => list_messages(&state, params),
        Method::Subscribe => subscribe(&state, params),
        Method::PollFeed => poll_feed(&state, params),
        Method::Unsubscribe => unsubscribe(&state, params),
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

type HandlerResult = Result<Value, ErrorInfo>;

fn engine_error(err: FieldwatchError) -> ErrorInfo {
    ErrorInfo::new(err.code(), err.to_string())
}

fn to_data<T: Serialize>(value: &T, what: &str) -> HandlerResult {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        )
    })
}

fn get_health(state: &SharedState) -> HandlerResult {
    let engine = state.engine();
    let mut data = json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "tick_interval_secs": engine.config().compliance.tick_interval().as_secs(),
        "sessions": state.session_count(),
    });
    if let Ok(value) = serde_json::to_value(engine.dispatcher_stats()) {
        data["dispatcher"] = value;
    }
    Ok(data)
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

fn activity_from_params(params: ActivityParams) -> Result<ScheduledActivity, ErrorInfo> {
    let start = parse_timestamp(&params.start, "start")?;
    let end = parse_timestamp(&params.end, "end")?;
    let mut activity = ScheduledActivity::new(
        params.activity_id,
        ActivityType::from_label(&params.activity_type),
        start,
        end,
    );
    activity.title = params.title;
    activity.site = params.site;
    Ok(activity)
}

fn register_worker(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: RegisterWorkerParams = parse_params(params)?;
    let mut worker = Worker::new(params.worker_id, params.name, params.role, params.department);
    worker.activity = params.activity.map(activity_from_params).transpose()?;

    state.register_worker(worker.clone()).map_err(engine_error)?;
    tracing::info!(worker_id = %worker.id, "Worker registered");
    to_data(&worker, "worker")
}

fn deactivate_worker(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: WorkerParams = parse_params(params)?;
    let worker = state
        .deactivate_worker(&params.worker_id, Utc::now())
        .map_err(engine_error)?;
    tracing::info!(worker_id = %worker.id, "Worker deactivated");
    to_data(&worker, "worker")
}

fn assign_activity(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: AssignActivityParams = parse_params(params)?;
    let activity = params.activity.map(activity_from_params).transpose()?;
    let (worker, transition) = state
        .assign_activity(&params.worker_id, activity, Utc::now())
        .map_err(engine_error)?;
    Ok(json!({
        "worker": to_data(&worker, "worker")?,
        "transition": to_data(&transition, "transition")?,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingress
// ─────────────────────────────────────────────────────────────────────────────

fn submit_location(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SubmitLocationParams = parse_params(params)?;
    let sampled_at = parse_timestamp(&params.sampled_at, "sampled_at")?;
    let point = GeoPoint::with_accuracy(params.lat, params.lng, params.accuracy_m);
    let outcome = state
        .submit_location(&params.worker_id, point, sampled_at, Utc::now())
        .map_err(engine_error)?;
    tracing::debug!(worker_id = %params.worker_id, outcome = ?outcome, "Location sample");
    Ok(json!({ "outcome": to_data(&outcome, "outcome")? }))
}

fn submit_check_in(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SubmitCheckInParams = parse_params(params)?;
    let timestamp = parse_timestamp(&params.timestamp, "timestamp")?;
    let check_in = CheckIn {
        worker_id: params.worker_id,
        timestamp,
        location: GeoPoint {
            lat: params.lat,
            lng: params.lng,
            accuracy_m: params.accuracy_m,
        },
        note: params.note,
    };
    let worker_id = check_in.worker_id.clone();
    let receipt = state
        .submit_check_in(check_in, Utc::now())
        .map_err(engine_error)?;
    tracing::info!(
        worker_id = %worker_id,
        outcome = ?receipt.outcome,
        state = receipt.state.as_str(),
        "Check-in received"
    );
    to_data(&receipt, "check-in receipt")
}

fn submit_emergency(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SubmitEmergencyParams = parse_params(params)?;
    let reported_at = parse_timestamp(&params.timestamp, "timestamp")?;
    let kind = match params.kind {
        EmergencyKindParam::Panic => EmergencyKind::Panic,
        EmergencyKindParam::Silent => EmergencyKind::Silent,
    };
    let location = match (params.lat, params.lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint {
            lat,
            lng,
            accuracy_m: params.accuracy_m,
        }),
        _ => None,
    };
    let receipt = state
        .engine()
        .submit_emergency(&params.worker_id, kind, reported_at, location, Utc::now())
        .map_err(engine_error)?;
    tracing::warn!(
        worker_id = %params.worker_id,
        kind = ?kind,
        outcome = ?receipt.outcome,
        "Emergency reported"
    );
    to_data(&receipt, "emergency receipt")
}

fn resolve_emergency(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: WorkerParams = parse_params(params)?;
    let transition = state
        .engine()
        .resolve_emergency(&params.worker_id, Utc::now())
        .map_err(engine_error)?;
    Ok(json!({ "transition": to_data(&transition, "transition")? }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

fn get_worker_status(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: WorkerParams = parse_params(params)?;
    let status = state
        .engine()
        .worker_status(&params.worker_id, Utc::now())
        .map_err(engine_error)?;
    to_data(&status, "worker status")
}

fn get_team_status(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let _: EmptyParams = parse_params(params)?;
    let team = state.engine().team_status(Utc::now());
    tracing::debug!(workers = team.workers.len(), "Team status snapshot");
    to_data(&team, "team status")
}

fn get_location_history(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: WorkerParams = parse_params(params)?;
    let history = state
        .engine()
        .location_history(&params.worker_id)
        .map_err(engine_error)?;
    to_data(&history, "location history")
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

fn list_alerts(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: ListAlertsParams = parse_params(params)?;
    let filter = match params.status {
        AlertStatusFilter::All => AlertFilter::All,
        AlertStatusFilter::Open => AlertFilter::Open,
        AlertStatusFilter::Active => AlertFilter::Active,
    };
    let kind = params.kind.as_deref().and_then(AlertKind::from_str);
    let mut alerts = state.engine().list_alerts(&filter);
    alerts.retain(|alert| {
        kind.map_or(true, |kind| alert.kind == kind)
            && params
                .worker_id
                .as_ref()
                .map_or(true, |worker_id| &alert.worker_id == worker_id)
    });
    to_data(&alerts, "alerts")
}

fn acknowledge_alert(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: AlertParams = parse_params(params)?;
    let alert = state
        .engine()
        .acknowledge_alert(&params.alert_id, Utc::now())
        .map_err(engine_error)?;
    tracing::info!(alert_id = %alert.id, "Alert acknowledged");
    to_data(&alert, "alert")
}

fn resolve_alert(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: AlertParams = parse_params(params)?;
    let alert = state
        .engine()
        .resolve_alert(&params.alert_id, Utc::now())
        .map_err(engine_error)?;
    tracing::info!(alert_id = %alert.id, "Alert resolved");
    to_data(&alert, "alert")
}

fn message_worker(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: MessageWorkerParams = parse_params(params)?;
    let (conversation, message) = state
        .message_worker(
            &params.alert_id,
            &params.sender_id,
            &params.content,
            Utc::now(),
        )
        .map_err(engine_error)?;
    Ok(json!({
        "conversation": to_data(&conversation, "conversation")?,
        "message": to_data(&message, "message")?,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Messaging
// ─────────────────────────────────────────────────────────────────────────────

fn create_conversation(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: CreateConversationParams = parse_params(params)?;
    let kind = match params.kind {
        ConversationKindParam::Direct => ConversationKind::Direct,
        ConversationKindParam::Group => ConversationKind::Group,
    };
    let conversation = state
        .create_conversation(kind, params.participants, params.name, Utc::now())
        .map_err(engine_error)?;
    to_data(&conversation, "conversation")
}

fn send_message(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SendMessageParams = parse_params(params)?;
    let message = state
        .send_message(
            &params.conversation_id,
            &params.sender_id,
            &params.content,
            Utc::now(),
        )
        .map_err(engine_error)?;
    to_data(&message, "message")
}

fn mark_read(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: MarkReadParams = parse_params(params)?;
    let marked = state
        .mark_read(&params.conversation_id, &params.reader_id)
        .map_err(engine_error)?;
    Ok(json!({ "marked": marked }))
}

fn list_conversations(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: ListConversationsParams = parse_params(params)?;
    let conversations = state.engine().list_conversations(&params.participant_id);
    to_data(&conversations, "conversations")
}

fn list_messages(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: ConversationParams = parse_params(params)?;
    let messages = state
        .engine()
        .list_messages(&params.conversation_id)
        .map_err(engine_error)?;
    to_data(&messages, "messages")
}

// ─────────────────────────────────────────────────────────────────────────────
// Feed
// ─────────────────────────────────────────────────────────────────────────────

fn subscribe(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SessionParams = parse_params(params)?;
    let backlog = state.subscribe(&params.session_id);
    Ok(json!({ "session_id": params.session_id, "backlog": backlog }))
}

fn poll_feed(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: PollFeedParams = parse_params(params)?;
    let events = state
        .poll(&params.session_id, params.limit())
        .ok_or_else(|| {
            ErrorInfo::new(
                "unknown_session",
                format!("session {} is not subscribed", params.session_id),
            )
        })?;
    to_data(&events, "feed events")
}

fn unsubscribe(state: &SharedState, params: Option<Value>) -> HandlerResult {
    let params: SessionParams = parse_params(params)?;
    let removed = state.unsubscribe(&params.session_id);
    Ok(json!({ "unsubscribed": removed }))
}
