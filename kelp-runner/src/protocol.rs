//! Control socket protocol: one JSON object per line in each direction.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kelp_core::Category;

use crate::error::{io_err, RunnerError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ControlRequest {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            category: None,
            enabled: None,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one request to the dev loop listening on `socket` and read one response.
pub fn send_request(
    socket: &Path,
    request: &ControlRequest,
) -> Result<ControlResponse, RunnerError> {
    if !socket.exists() {
        return Err(RunnerError::NotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            RunnerError::NotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(RunnerError::Protocol(
            "dev loop closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Status of a running dev loop, retrying briefly while the socket comes up.
pub fn request_status(socket: &Path) -> Result<Value, RunnerError> {
    let request = ControlRequest::new("status");

    let mut last_not_running: Option<RunnerError> = None;
    for attempt in 0..5 {
        match send_request(socket, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ RunnerError::NotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        RunnerError::Protocol("status retry loop exited unexpectedly".to_string())
    }))
}

/// Fire `category` on the next poll.
pub fn request_trigger(socket: &Path, category: Category) -> Result<Value, RunnerError> {
    let request = ControlRequest {
        category: Some(category),
        ..ControlRequest::new("trigger")
    };
    response_into_data(send_request(socket, &request)?)
}

/// Switch `category` between auto and manual triggering.
pub fn request_auto(
    socket: &Path,
    category: Category,
    enabled: bool,
) -> Result<Value, RunnerError> {
    let request = ControlRequest {
        category: Some(category),
        enabled: Some(enabled),
        ..ControlRequest::new("auto")
    };
    response_into_data(send_request(socket, &request)?)
}

pub fn request_stop(socket: &Path) -> Result<(), RunnerError> {
    let response = send_request(socket, &ControlRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

fn response_into_data(response: ControlResponse) -> Result<Value, RunnerError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(RunnerError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown dev loop error".to_string()),
        ))
    }
}
