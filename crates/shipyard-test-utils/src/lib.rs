use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status_line: String,
    pub body: String,
}

impl MockResponse {
    pub fn new(status_line: &str, body: &str) -> Self {
        Self {
            status_line: status_line.to_string(),
            body: body.to_string(),
        }
    }

    pub fn ok(body: &str) -> Self {
        Self::new("200 OK", body)
    }
}

/// Spawn a one-shot HTTP mock server that accepts a single request, captures it,
/// and responds with the given status line and body. Returns the base URL and a
/// receiver that yields the captured request.
pub fn spawn_one_shot_server(
    status_line: &str,
    response_body: &str,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();
    let response = MockResponse::new(status_line, response_body);

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept mock request");
        let req = read_http_request(&mut stream).expect("read mock request");
        tx.send(req).expect("send captured request");
        write_response(&mut stream, &response);
    });

    (format!("http://{addr}"), rx)
}

/// Long-lived HTTP mock server. Every request is passed to the handler, which
/// picks the response, and is then recorded for later inspection.
pub struct MockServer {
    base_url: String,
    port: u16,
    requests: mpsc::Receiver<CapturedRequest>,
}

impl MockServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&CapturedRequest) -> MockResponse + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("read mock server addr");
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    continue;
                };
                let Some(req) = read_http_request(&mut stream) else {
                    continue;
                };
                let response = handler(&req);
                let _ = tx.send(req);
                write_response(&mut stream, &response);
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            port: addr.port(),
            requests: rx,
        }
    }

    /// Serve `responses` in order; the last one repeats once the script runs out.
    pub fn scripted(responses: Vec<MockResponse>) -> Self {
        assert!(!responses.is_empty(), "scripted server needs a response");
        let served = AtomicUsize::new(0);
        Self::start(move |_| {
            let idx = served.fetch_add(1, Ordering::SeqCst);
            responses[idx.min(responses.len() - 1)].clone()
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Requests received so far, in arrival order.
    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.try_iter().collect()
    }
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) {
    let payload = format!(
        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        response.status_line,
        response.body.len(),
        response.body
    );
    let _ = stream.write_all(payload.as_bytes());
    let _ = stream.flush();
}

fn read_http_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut header_end = None;
    let mut content_length = 0usize;

    loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if header_end.is_none() {
            header_end = buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|idx| idx + 4);
            if let Some(end) = header_end {
                let headers = String::from_utf8_lossy(&buf[..end]);
                for line in headers.lines() {
                    if let Some((key, value)) = line.split_once(':') {
                        if key.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse::<usize>().unwrap_or(0);
                        }
                    }
                }
            }
        }
        if let Some(end) = header_end {
            if buf.len() >= end + content_length {
                break;
            }
        }
    }

    let end = header_end?;
    let headers_raw = String::from_utf8_lossy(&buf[..end]);
    let mut lines = headers_raw.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let body_end = (end + content_length).min(buf.len());
    let body = String::from_utf8_lossy(&buf[end..body_end]).to_string();

    Some(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}
