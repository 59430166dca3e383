//! Client helper for sending page events to the tabwatch daemon.
//!
//! The daemon is the only writer of tab state. Failures surface to the
//! caller; there is no file-based fallback.

use chrono::Utc;
use rand::RngCore;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tabwatch_protocol::{
    EventEnvelope, EventKind, Method, Request, Response, Service, TabId, TabStatus,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const ENABLE_ENV: &str = "TABWATCH_DAEMON_ENABLED";
const SOCKET_ENV: &str = "TABWATCH_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

fn blank_event(kind: EventKind, tab_id: TabId) -> EventEnvelope {
    EventEnvelope {
        event_id: make_event_id(tab_id),
        recorded_at: Utc::now().to_rfc3339(),
        kind,
        tab_id: Some(tab_id),
        service: None,
        status: None,
        message: None,
        url: None,
        title: None,
        request_id: None,
        phase: None,
    }
}

pub fn send_status_update(
    tab_id: TabId,
    service: Service,
    status: TabStatus,
    url: Option<&str>,
    title: Option<&str>,
) -> Result<(), String> {
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }
    let template = {
        let mut event = blank_event(EventKind::StatusUpdate, tab_id);
        event.service = Some(service);
        event.status = Some(status);
        event.url = url.map(str::to_string);
        event.title = title.map(str::to_string);
        event
    };
    send_event_with_retry(|| template.clone(), "status update")
}

pub fn send_task_completed(tab_id: TabId, service: Service, message: &str) -> Result<(), String> {
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }
    let template = {
        let mut event = blank_event(EventKind::TaskCompleted, tab_id);
        event.service = Some(service);
        event.message = Some(message.to_string());
        event
    };
    send_event_with_retry(|| template.clone(), "task completion")
}

pub fn send_network_event(
    tab_id: TabId,
    service: Service,
    status: TabStatus,
) -> Result<(), String> {
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }
    let template = {
        let mut event = blank_event(EventKind::NetworkEvent, tab_id);
        event.service = Some(service);
        event.status = Some(status);
        event
    };
    send_event_with_retry(|| template.clone(), "network event")
}

pub fn send_registration(
    tab_id: TabId,
    service: Service,
    register: bool,
    url: Option<&str>,
) -> Result<(), String> {
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }
    let kind = if register {
        EventKind::RegisterServiceTab
    } else {
        EventKind::UnregisterServiceTab
    };
    let template = {
        let mut event = blank_event(kind, tab_id);
        event.service = Some(service);
        event.url = url.map(str::to_string);
        event
    };
    send_event_with_retry(|| template.clone(), "tab registration")
}

pub fn daemon_health() -> Option<bool> {
    if !daemon_enabled() {
        return None;
    }

    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::GetHealth,
        id: Some("health-check".to_string()),
        params: None,
    };

    let response = send_request(request).ok()?;
    if !response.ok {
        return Some(false);
    }

    let status = response
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(|value| value.as_str());

    Some(matches!(status, Some("ok")))
}

/// Open a push subscription. Returns the stream positioned after the
/// acknowledgement; every subsequent line is a broadcast frame.
pub fn subscribe() -> Result<UnixStream, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Subscribe,
        id: Some("subscribe".to_string()),
        params: None,
    };
    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write subscribe request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush subscribe request: {}", err))?;
    stream.flush().ok();

    let response = read_response(&mut stream)?;
    if !response.ok {
        let message = response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string());
        return Err(message);
    }

    // Pushes arrive whenever the daemon has something to say.
    let _ = stream.set_read_timeout(None);
    Ok(stream)
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabwatch").join(SOCKET_NAME))
}

fn send_event(event: EventEnvelope) -> Result<(), String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Event,
        id: Some(event.event_id.clone()),
        params: Some(
            serde_json::to_value(event)
                .map_err(|err| format!("Failed to serialize event: {}", err))?,
        ),
    };

    let response = send_request(request)?;
    if response.ok {
        Ok(())
    } else {
        let message = response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string());
        Err(message)
    }
}

/// One retry with the same event id, so a retry after a lost response
/// cannot double-count.
fn send_event_with_retry<F>(mut build: F, label: &str) -> Result<(), String>
where
    F: FnMut() -> EventEnvelope,
{
    match send_event(build()) {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_event(build()).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    "Retry failed sending {} to daemon",
                    label
                );
                retry_err
            })
        }
    }
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_event_id(tab_id: TabId) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!(
        "evt-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        tab_id,
        rand
    )
}
