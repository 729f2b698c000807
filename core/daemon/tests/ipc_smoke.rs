use chrono::Utc;
use fieldwatch_daemon_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_fieldwatch-daemon"))
        .env("HOME", home)
        .env_remove("FIELDWATCH_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn fieldwatch-daemon");
    DaemonGuard { child }
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".fieldwatch").join("daemon.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn call(socket: &Path, method: Method, params: Value) -> Response {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("{:?}", method)),
        params: Some(params),
    };
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn send_raw(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    stream.write_all(payload).expect("Failed to write raw payload");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn register_worker(socket: &Path, worker_id: &str) {
    let now = Utc::now();
    let response = call(
        socket,
        Method::RegisterWorker,
        json!({
            "worker_id": worker_id,
            "name": "Ana Reyes",
            "role": "Arborist",
            "department": "Parks",
            "activity": {
                "activity_id": format!("{}-act", worker_id),
                "activity_type": "inspection",
                "start": (now - chrono::Duration::hours(1)).to_rfc3339(),
                "end": (now + chrono::Duration::hours(7)).to_rfc3339()
            }
        }),
    );
    assert!(response.ok, "register failed: {:?}", response.error);
}

#[test]
fn daemon_ipc_health_check_in_and_feed_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = call(&socket, Method::GetHealth, json!({}));
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health data");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["protocol_version"], PROTOCOL_VERSION);

    register_worker(&socket, "w-1");

    let subscribe = call(&socket, Method::Subscribe, json!({ "session_id": "sup-1" }));
    assert!(subscribe.ok, "subscribe failed: {:?}", subscribe.error);

    let check_in = call(
        &socket,
        Method::SubmitCheckIn,
        json!({
            "worker_id": "w-1",
            "timestamp": Utc::now().to_rfc3339(),
            "lat": -41.29,
            "lng": 174.78,
            "accuracy_m": 6.0
        }),
    );
    assert!(check_in.ok, "check-in failed: {:?}", check_in.error);
    assert_eq!(check_in.data.expect("receipt")["state"], "on_schedule");

    let emergency = call(
        &socket,
        Method::SubmitEmergency,
        json!({
            "worker_id": "w-1",
            "kind": "panic",
            "timestamp": Utc::now().to_rfc3339(),
            "lat": -41.29,
            "lng": 174.78
        }),
    );
    assert!(emergency.ok, "emergency failed: {:?}", emergency.error);

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut labels = Vec::new();
    while Instant::now() < deadline && !labels.iter().any(|l| l == "alert_raised") {
        let poll = call(&socket, Method::PollFeed, json!({ "session_id": "sup-1" }));
        assert!(poll.ok, "poll failed: {:?}", poll.error);
        if let Some(events) = poll.data.as_ref().and_then(|d| d.as_array()) {
            labels.extend(
                events
                    .iter()
                    .filter_map(|event| event["type"].as_str().map(str::to_string)),
            );
        }
        sleep(Duration::from_millis(25));
    }
    assert!(labels.iter().any(|l| l == "alert_raised"), "labels: {:?}", labels);

    let team = call(&socket, Method::GetTeamStatus, json!({}));
    let team = team.data.expect("team data");
    assert_eq!(team["counts"]["emergency"], 1);
    assert_eq!(team["workers"][0]["compliance"]["state"], "emergency");
}

#[test]
fn daemon_rejects_malformed_requests_and_stays_healthy() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let response = send_raw(&socket, b"{not json}\n");
    assert!(!response.ok);
    assert_eq!(response.error.map(|e| e.code), Some("invalid_json".to_string()));

    let response = send_raw(&socket, b"   \n");
    assert_eq!(response.error.map(|e| e.code), Some("empty_request".to_string()));

    let response = call(
        &socket,
        Method::SubmitCheckIn,
        json!({ "worker_id": "w-1", "timestamp": "yesterday", "lat": 0.0, "lng": 0.0 }),
    );
    assert_eq!(
        response.error.map(|e| e.code),
        Some("invalid_timestamp".to_string())
    );

    let health = call(&socket, Method::GetHealth, json!({}));
    assert!(health.ok);
}

#[test]
fn daemon_restart_keeps_workers_and_alerts() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());

    let alert_id = {
        let _guard = spawn_daemon(home.path());
        wait_for_socket(&socket, Duration::from_secs(5));
        register_worker(&socket, "w-1");
        let emergency = call(
            &socket,
            Method::SubmitEmergency,
            json!({
                "worker_id": "w-1",
                "kind": "silent",
                "timestamp": Utc::now().to_rfc3339()
            }),
        );
        let alert_id = emergency.data.expect("receipt")["alert"]["id"]
            .as_str()
            .expect("alert id")
            .to_string();

        // The store sink runs on the dispatcher thread; wait until the alert lands.
        let db_path = home.path().join(".fieldwatch").join("daemon").join("state.db");
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && !db_path.exists() {
            sleep(Duration::from_millis(25));
        }
        sleep(Duration::from_millis(300));
        alert_id
    };

    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let status = call(&socket, Method::GetWorkerStatus, json!({ "worker_id": "w-1" }));
    assert!(status.ok, "status failed: {:?}", status.error);
    let status = status.data.expect("status data");
    assert_eq!(status["compliance"]["state"], "emergency");

    let alerts = call(&socket, Method::ListAlerts, json!({ "status": "open" }));
    let alerts = alerts.data.expect("alerts");
    assert_eq!(alerts[0]["id"], alert_id.as_str());
}
