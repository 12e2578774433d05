//! Minimal multi-file HTTP/1.1 server for integration tests.
//!
//! Serves a set of paths with Range GET support, optional status overrides
//! per path, and a request log so tests can assert on wire traffic.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// One served path.
#[derive(Clone)]
pub struct Route {
    pub body: Vec<u8>,
    /// Respond with this status and no body instead of serving.
    pub status_override: Option<u16>,
}

impl Route {
    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Route {
            body: body.into(),
            status_override: None,
        }
    }

    pub fn status(code: u16) -> Self {
        Route {
            body: Vec::new(),
            status_override: Some(code),
        }
    }
}

/// One logged request.
#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub path: String,
    /// Start byte of a `Range: bytes=X-` header, if one was sent.
    pub range_start: Option<u64>,
}

#[derive(Default)]
pub struct ServerState {
    pub requests: Mutex<Vec<LoggedRequest>>,
    pub body_bytes_sent: AtomicU64,
}

impl ServerState {
    pub fn request_count(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.body_bytes_sent.load(Ordering::SeqCst)
    }
}

/// Start a server for `routes`. Returns the base URL (no trailing slash)
/// and the shared request log. Runs until the process exits.
pub fn start(routes: HashMap<String, Route>) -> (String, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(ServerState::default());
    let routes = Arc::new(routes);
    let accept_state = Arc::clone(&state);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let routes = Arc::clone(&routes);
            let state = Arc::clone(&accept_state);
            thread::spawn(move || handle(stream, &routes, &state));
        }
    });
    (format!("http://127.0.0.1:{}", port), state)
}

fn handle(mut stream: std::net::TcpStream, routes: &HashMap<String, Route>, state: &ServerState) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, path, range) = parse_request(request);
    if method.is_empty() || path.is_empty() {
        return;
    }
    state.requests.lock().unwrap().push(LoggedRequest {
        path: path.to_string(),
        range_start: range.map(|(start, _)| start),
    });

    let route = match routes.get(path) {
        Some(r) => r,
        None => {
            let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
    };
    if let Some(code) = route.status_override {
        let response = format!(
            "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            code
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let body = &route.body;
    let total = body.len() as u64;
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) => {
            let start = start.min(total);
            let end_excl = end_incl.saturating_add(1).min(total);
            if start >= end_excl {
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        total
                    )
                    .as_bytes(),
                );
                return;
            }
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/{}", start, end_excl - 1, total)),
                &body[start as usize..end_excl as usize],
            )
        }
        None => ("200 OK", None, &body[..]),
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n",
        status,
        slice.len()
    );
    if let Some(cr) = content_range {
        response.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).is_ok() && method != "HEAD" {
        if stream.write_all(slice).is_ok() {
            state
                .body_bytes_sent
                .fetch_add(slice.len() as u64, Ordering::SeqCst);
        }
    }
}

/// Returns (method, path, optional (start, end_inclusive)) from the request
/// head. An open-ended `bytes=X-` range maps the end to `u64::MAX`.
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut method = "";
    let mut path = "";
    let mut range = None;
    for (i, line) in request.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if i == 0 {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            path = parts.next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, path, range)
}
