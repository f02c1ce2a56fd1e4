//! Hand-rolled fake webhook/attachment host for integration tests.
//!
//! Real `RateLimitedClient`s only accept `discord.com` URLs, so these tests
//! exercise the webhook contract over raw TCP instead of swapping in a
//! trait double: one listener plays both roles the core talks to. It
//! accepts the multipart POST a chunk upload makes and serves the ranged GET
//! a chunk read makes against the URL it handed back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Canned behavior for the next upload response: status code plus the
/// `X-RateLimit-*` headers to attach. `status != 200` makes the fake return
/// a bare error body instead of the attachments JSON.
#[derive(Clone)]
pub struct UploadBehavior {
    pub status: u16,
    pub remaining: Option<i64>,
    pub reset_at_unix: Option<i64>,
}

impl Default for UploadBehavior {
    fn default() -> Self {
        Self {
            status: 200,
            remaining: None,
            reset_at_unix: None,
        }
    }
}

struct Stored {
    body: Vec<u8>,
}

struct Shared {
    objects: Mutex<HashMap<u64, Stored>>,
    next_id: AtomicU64,
    upload_behavior: Mutex<UploadBehavior>,
    /// When set, the attachment GET responds with this status instead of 206.
    fetch_status_override: Mutex<Option<u16>>,
    uploads_seen: AtomicU64,
}

/// A running fake webhook host. Drop to stop accepting new connections
/// (in-flight ones already spawned keep running to completion).
pub struct FakeHost {
    pub base_url: String,
    shared: Arc<Shared>,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl FakeHost {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let port = listener.local_addr().expect("local_addr").port();
        let shared = Arc::new(Shared {
            objects: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            upload_behavior: Mutex::new(UploadBehavior::default()),
            fetch_status_override: Mutex::new(None),
            uploads_seen: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, shared).await;
                });
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            shared,
            _accept_task: accept_task,
        }
    }

    /// URL form the core's `validate_webhook_url` accepts only under the
    /// `test-support` feature: a loopback host standing in for `discord.com`.
    pub fn webhook_url(&self) -> String {
        format!("{}/api/webhooks/1/faketoken", self.base_url)
    }

    pub async fn set_next_upload_behavior(&self, behavior: UploadBehavior) {
        *self.shared.upload_behavior.lock().await = behavior;
    }

    pub async fn set_fetch_status_override(&self, status: u16) {
        *self.shared.fetch_status_override.lock().await = Some(status);
    }

    pub async fn uploads_seen(&self) -> u64 {
        self.shared.uploads_seen.load(Ordering::Relaxed)
    }
}

async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let (method, path, headers, body) = read_request(&mut stream).await?;

    if method == "POST" {
        handle_upload(&mut stream, &shared, &headers, body).await?;
    } else if method == "GET" {
        handle_fetch(&mut stream, &shared, &path, &headers).await?;
    } else {
        write_response(&mut stream, 405, &[], b"").await?;
    }
    Ok(())
}

async fn read_request(
    stream: &mut TcpStream,
) -> std::io::Result<(String, String, HashMap<String, String>, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break Some(pos);
        }
    };
    let Some(header_end) = header_end else {
        return Ok((String::new(), String::new(), HashMap::new(), Vec::new()));
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok((method, path, headers, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extracts the single file part's content from a `multipart/form-data`
/// body built by `reqwest::multipart::Form`. Good enough for bodies with
/// exactly one part, which is the only shape the core ever sends.
fn extract_multipart_body(content_type: &str, body: &[u8]) -> Vec<u8> {
    let Some(boundary) = content_type
        .split("boundary=")
        .nth(1)
        .map(|s| s.trim_matches('"'))
    else {
        return body.to_vec();
    };
    let marker = format!("--{boundary}").into_bytes();
    let Some(first) = find_subslice(body, &marker) else {
        return body.to_vec();
    };
    let after_first_boundary = &body[first + marker.len()..];
    let Some(headers_end) = find_subslice(after_first_boundary, b"\r\n\r\n") else {
        return body.to_vec();
    };
    let content_start = headers_end + 4;
    let rest = &after_first_boundary[content_start..];
    let end = find_subslice(rest, &marker).unwrap_or(rest.len());
    // Strip the trailing CRLF the multipart writer inserts before the
    // closing boundary.
    let mut content = rest[..end].to_vec();
    while content.last() == Some(&b'\n') || content.last() == Some(&b'\r') {
        content.pop();
    }
    content
}

async fn handle_upload(
    stream: &mut TcpStream,
    shared: &Shared,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> std::io::Result<()> {
    shared.uploads_seen.fetch_add(1, Ordering::Relaxed);
    let content_type = headers.get("content-type").cloned().unwrap_or_default();
    let content = extract_multipart_body(&content_type, &body);
    let size = content.len() as u64;

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    shared
        .objects
        .lock()
        .await
        .insert(id, Stored { body: content });

    let behavior = shared.upload_behavior.lock().await.clone();
    let mut response_headers = Vec::new();
    if let Some(remaining) = behavior.remaining {
        response_headers.push(("X-RateLimit-Remaining".to_string(), remaining.to_string()));
    }
    if let Some(reset_at) = behavior.reset_at_unix {
        response_headers.push(("X-RateLimit-Reset".to_string(), reset_at.to_string()));
    }

    if behavior.status != 200 {
        write_response(stream, behavior.status, &response_headers, b"error").await?;
        return Ok(());
    }

    // The attachment URL points back at this same host's fetch path; the
    // core never inspects the URL's shape beyond what `read_range` sends.
    let port = stream.local_addr()?.port();
    let json = format!(
        r#"{{"attachments":[{{"url":"http://127.0.0.1:{port}/attachments/{id}","size":{size}}}]}}"#
    );
    response_headers.push(("Content-Type".to_string(), "application/json".to_string()));
    write_response(stream, 200, &response_headers, json.as_bytes()).await
}

async fn handle_fetch(
    stream: &mut TcpStream,
    shared: &Shared,
    path: &str,
    headers: &HashMap<String, String>,
) -> std::io::Result<()> {
    if let Some(status) = *shared.fetch_status_override.lock().await {
        write_response(stream, status, &[], b"").await?;
        return Ok(());
    }

    let Some(id_str) = path.strip_prefix("/attachments/") else {
        return write_response(stream, 404, &[], b"").await;
    };
    let Ok(id) = id_str.parse::<u64>() else {
        return write_response(stream, 404, &[], b"").await;
    };
    let objects = shared.objects.lock().await;
    let Some(stored) = objects.get(&id) else {
        return write_response(stream, 404, &[], b"").await;
    };

    let (start, end) = headers
        .get("range")
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|range| range.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)))
        .unwrap_or((0, stored.body.len().saturating_sub(1)));

    if start >= stored.body.len() || end >= stored.body.len() || start > end {
        return write_response(stream, 416, &[], b"").await;
    }
    let slice = &stored.body[start..=end];
    let response_headers = vec![(
        "Content-Range".to_string(),
        format!("bytes {start}-{end}/{}", stored.body.len()),
    )];
    write_response(stream, 206, &response_headers, slice).await
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    extra_headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        _ => "Error",
    };
    let mut response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\n", body.len());
    for (k, v) in extra_headers {
        response.push_str(&format!("{k}: {v}\r\n"));
    }
    response.push_str("Connection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await?;
    Ok(())
}
