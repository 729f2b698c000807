//! Client helper for talking to the fieldwatch daemon over its Unix socket.
//!
//! One request per connection. Only connection failures are retried: a
//! request that reached the daemon is never sent twice.

use fieldwatch_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "FIELDWATCH_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

/// Sends `method` with `params` and returns the response data.
pub fn call(method: Method, params: Value) -> Result<Value, ClientError> {
    let request = || Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("ctl-{}", std::process::id())),
        params: Some(params.clone()),
    };

    let response = match send_request(request()) {
        Err(err @ ClientError::Connect { .. }) => {
            tracing::warn!(error = %err, method = ?method, "Daemon connect failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(request())?
        }
        other => other?,
    };

    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let (code, message) = response
            .error
            .map(|err| (err.code, err.message))
            .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
        Err(ClientError::Daemon { code, message })
    }
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".fieldwatch").join(SOCKET_NAME))
}

fn send_request(request: Request) -> Result<Response, ClientError> {
    let path = socket_path()?;
    let mut stream = UnixStream::connect(&path).map_err(|source| ClientError::Connect {
        path: path.clone(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| ClientError::InvalidResponse(format!("Failed to write request: {}", err)))?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::InvalidResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    parse_response(&buffer)
}

fn parse_response(buffer: &[u8]) -> Result<Response, ClientError> {
    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer,
    };
    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse(
            "daemon response was empty".to_string(),
        ));
    }
    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(format!("not valid JSON: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_line_only() {
        let response =
            parse_response(b"{\"ok\":true,\"data\":{\"status\":\"ok\"}}\ntrailing").expect("parse");
        assert!(response.ok);
        assert_eq!(response.data.expect("data")["status"], "ok");
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(matches!(
            parse_response(b"\n"),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[test]
    fn daemon_errors_render_code_and_message() {
        let err = ClientError::Daemon {
            code: "unknown_worker".to_string(),
            message: "Unknown worker: w-9".to_string(),
        };
        assert_eq!(err.to_string(), "unknown_worker: Unknown worker: w-9");
    }
}
