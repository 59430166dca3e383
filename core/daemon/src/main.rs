//! Tabwatch daemon entrypoint.
//!
//! A small single-writer service: a socket listener, strict request
//! validation, and the authoritative tab-state table fed by page detectors
//! and the request layer. Presentation surfaces subscribe for push frames
//! over the same socket.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tabwatch_protocol::{
    parse_event, ErrorInfo, EventKind, Method, Request, Response, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

mod backoff;
mod classify;
mod config;
mod host;
mod network;
mod registry;
mod resolve;
mod state;
mod tabs;

use host::BridgeHost;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV_OVERRIDE: &str = "TABWATCH_DAEMON_SOCKET";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    if let Ok(path) = daemon_backoff_path() {
        backoff::apply_startup_backoff(&path);
    } else {
        warn!("Failed to resolve daemon backoff path");
    }

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Tabwatch daemon started");

    let runtime_config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load runtime config; using defaults");
            config::RuntimeConfig::default()
        }
    };
    info!(
        settle_ms = runtime_config.network.settle_ms,
        tick_ms = runtime_config.runtime.tick_ms,
        "Runtime config loaded"
    );

    let bridge_host = Arc::new(BridgeHost::new());
    let shared_state = Arc::new(SharedState::new(
        bridge_host.clone(),
        runtime_config.network.settle_ms,
        runtime_config.badge.enabled,
    ));
    spawn_settle_pump(Arc::clone(&shared_state), runtime_config.runtime.tick_ms);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                let host = Arc::clone(&bridge_host);
                thread::spawn(|| handle_connection(stream, state, host));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

/// Settle deadlines are lazy; this thread is the only thing that fires them
/// while the socket is quiet.
fn spawn_settle_pump(state: Arc<SharedState>, tick_ms: u64) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_millis(tick_ms.max(10)));
        state.flush_due_settles(chrono::Utc::now());
    });
}

fn init_logging() {
    let debug_enabled = env::var("TABWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV_OVERRIDE) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabwatch").join(SOCKET_NAME))
}

fn daemon_backoff_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home
        .join(".tabwatch")
        .join("daemon")
        .join("daemon-backoff.json"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>, host: Arc<BridgeHost>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let subscribing = matches!(request.method, Method::Subscribe);
    let response = handle_request(request, &state, &host);
    let accepted = response.ok;
    let _ = write_response(&mut stream, response);

    if subscribing && accepted {
        // The request connection becomes the push channel.
        let _ = stream.set_read_timeout(None);
        host.subscribe(stream);
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &Arc<SharedState>, host: &Arc<BridgeHost>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "tracked_tabs": state.tab_states().len(),
                "completed_count": state.completed_count(),
                "subscribers": host.subscriber_count(),
            });
            Response::ok(request.id, data)
        }
        Method::GetTabStates => match serde_json::to_value(tab_states_object(state)) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize tab states: {}", err),
            ),
        },
        Method::Subscribe => {
            // Hand the subscriber a snapshot so it does not start blind.
            match serde_json::to_value(tab_states_object(state)) {
                Ok(value) => Response::ok(
                    request.id,
                    serde_json::json!({ "subscribed": true, "tab_states": value }),
                ),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize tab states: {}", err),
                ),
            }
        }
        Method::Event => handle_event(request, state, host),
    }
}

fn tab_states_object(state: &Arc<SharedState>) -> serde_json::Map<String, serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (tab_id, wire) in state.tab_states() {
        if let Ok(value) = serde_json::to_value(&wire) {
            object.insert(tab_id.to_string(), value);
        }
    }
    object
}

fn handle_event(request: Request, state: &Arc<SharedState>, host: &Arc<BridgeHost>) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };

    let event = match parse_event(params) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        kind = ?event.kind,
        tab_id = ?event.tab_id,
        service = ?event.service.map(|s| s.as_str()),
        status = ?event.status.map(|s| s.as_str()),
        "Received event"
    );

    let now = chrono::Utc::now();
    mirror_tab_inventory(&event, host, now);
    state.handle_event(&event, now);
    if event.kind == EventKind::TabRemoved {
        if let Some(tab_id) = event.tab_id {
            host.forget_tab(tab_id);
        }
    }

    Response::ok(request.id, serde_json::json!({"accepted": true}))
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// The daemon has no direct view of the browser's tab list; it mirrors one
/// from whatever events reveal. Must run before dispatch so network commits
/// can look the tab up.
fn mirror_tab_inventory(
    event: &tabwatch_protocol::EventEnvelope,
    host: &Arc<BridgeHost>,
    now: chrono::DateTime<chrono::Utc>,
) {
    let Some(tab_id) = event.tab_id.filter(|id| *id >= 0) else {
        return;
    };
    match event.kind {
        EventKind::StatusUpdate
        | EventKind::TaskCompleted
        | EventKind::NetworkEvent
        | EventKind::RegisterServiceTab => {
            host.observe_tab(tab_id, event.url.as_deref(), event.title.as_deref(), now);
        }
        EventKind::TabActivated => {
            host.touch_tab(tab_id, now);
        }
        EventKind::RawRequest | EventKind::UnregisterServiceTab | EventKind::TabRemoved => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn responses_are_newline_framed_json() {
        let (mut daemon_side, client_side) = UnixStream::pair().expect("socket pair");
        let response = Response::ok(
            Some("req-1".to_string()),
            serde_json::json!({"accepted": true}),
        );
        write_response(&mut daemon_side, response).expect("write response");

        let mut reader = BufReader::new(client_side);
        let mut line = String::new();
        reader.read_line(&mut line).expect("read response");
        assert!(line.ends_with('\n'));
        let parsed: Response = serde_json::from_str(line.trim()).expect("parse response");
        assert!(parsed.ok);
        assert_eq!(parsed.id.as_deref(), Some("req-1"));
    }

    #[test]
    fn write_response_fails_on_closed_stream() {
        let (mut daemon_side, client_side) = UnixStream::pair().expect("socket pair");
        drop(client_side);
        let response = Response::error(None, "test_error", "simulated");
        assert!(write_response(&mut daemon_side, response).is_err());
    }
}
