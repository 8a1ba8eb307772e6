//! Control-plane client for the VMM's Unix-domain socket.
//!
//! The Firecracker API is a handful of tiny `PUT` requests with JSON bodies,
//! so this speaks just enough HTTP/1.1 over the socket: one request per
//! connection, status line + headers parsed, `fault_message` surfaced from
//! error bodies.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub struct VmmClient {
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Issue a `PUT` against the VMM API. Succeeds on any 2xx status.
    pub async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), String> {
        let payload = serde_json::to_vec(body).map_err(|e| format!("encode body: {}", e))?;

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| format!("connect {}: {}", self.socket_path.display(), e))?;

        let request = format_request(path, &payload);
        stream
            .write_all(&request)
            .await
            .map_err(|e| format!("write request: {}", e))?;

        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(response) = parse_response(&buf) {
                return check_status(path, response);
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| format!("read response: {}", e))?;
            if n == 0 {
                return match parse_response(&buf) {
                    Some(response) => check_status(path, response),
                    None => Err(format!("PUT {}: connection closed mid-response", path)),
                };
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn check_status(path: &str, response: ParsedResponse) -> Result<(), String> {
    if response.status < 300 {
        Ok(())
    } else {
        Err(format!(
            "PUT {} returned {}: {}",
            path,
            response.status,
            fault_message(&response.body)
        ))
    }
}

pub(crate) fn format_request(path: &str, payload: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "PUT {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        path,
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(payload);
    request
}

pub(crate) struct ParsedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Parse a buffered response. Returns None while the buffer is still
/// missing the header terminator or part of the declared body.
pub(crate) fn parse_response(buf: &[u8]) -> Option<ParsedResponse> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;

    let status_line = head.lines().next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let content_length = head
        .lines()
        .skip(1)
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    if buf.len() < head_end + content_length {
        return None;
    }

    Some(ParsedResponse {
        status,
        body: buf[head_end..head_end + content_length].to_vec(),
    })
}

/// Pull `fault_message` out of an error body, falling back to the raw text.
fn fault_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct Fault {
        fault_message: String,
    }

    if let Ok(fault) = serde_json::from_slice::<Fault>(body) {
        return fault.fault_message;
    }
    String::from_utf8_lossy(body).trim().to_string()
}
