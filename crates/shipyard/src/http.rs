//! Small JSON transport used by the drivers and the prober.
//!
//! Every call is bounded by a per-request timeout and retried a fixed number of
//! times with a fixed pause. Non-2xx responses become [`HttpError::Status`]
//! before the retry loop sees them, so application errors and network errors
//! are retried the same way, except for statuses the caller marks final.

use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::HttpError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 4;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    /// Statuses that end the retry loop at once. The caller still gets the
    /// error and decides what it means.
    pub final_statuses: Vec<u16>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            headers: Vec::new(),
            bearer_token: None,
            final_statuses: Vec::new(),
        }
    }
}

impl RequestOptions {
    /// Single attempt, for callers that run their own retry policy or loop.
    pub fn once() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_final_status(mut self, status: u16) -> Self {
        self.final_statuses.push(status);
        self
    }

    fn is_final(&self, err: &HttpError) -> bool {
        err.status()
            .is_some_and(|status| self.final_statuses.contains(&status))
    }
}

#[derive(Clone, Debug, Default)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<T, HttpError> {
        let text = self.send(Method::GET, url, None::<&()>, opts).await?;
        decode(url, &text)
    }

    pub async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let text = self.send(Method::POST, url, Some(body), opts).await?;
        decode(url, &text)
    }

    /// GET returning the raw body, for endpoints whose body is optional.
    pub async fn get_text(&self, url: &str, opts: &RequestOptions) -> Result<String, HttpError> {
        self.send(Method::GET, url, None::<&()>, opts).await
    }

    pub async fn delete(&self, url: &str, opts: &RequestOptions) -> Result<(), HttpError> {
        self.send(Method::DELETE, url, None::<&()>, opts)
            .await
            .map(|_| ())
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        opts: &RequestOptions,
    ) -> Result<String, HttpError> {
        let attempts = opts.retries + 1;
        let mut attempt = 1;
        loop {
            match self.send_once(&method, url, body, opts).await {
                Ok(text) => return Ok(text),
                Err(err) if attempt < attempts && !opts.is_final(&err) => {
                    debug!(
                        %method,
                        %url,
                        attempt,
                        attempts,
                        error = %err,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(opts.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
        opts: &RequestOptions,
    ) -> Result<String, HttpError> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .timeout(opts.timeout);
        if let Some(token) = &opts.bearer_token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &opts.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let request_error = |source: reqwest::Error| {
            if source.is_timeout() {
                HttpError::Timeout {
                    method: method.to_string(),
                    url: url.to_string(),
                }
            } else {
                HttpError::Request {
                    method: method.to_string(),
                    url: url.to_string(),
                    source,
                }
            }
        };

        let resp = builder.send().await.map_err(request_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(HttpError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

fn decode<T: DeserializeOwned>(url: &str, text: &str) -> Result<T, HttpError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text).map_err(|source| HttpError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use shipyard_test_utils::{spawn_one_shot_server, MockResponse, MockServer};

    fn fast_retries() -> RequestOptions {
        RequestOptions::default().with_retries(DEFAULT_RETRIES, Duration::from_millis(10))
    }

    fn failing(times: usize) -> MockServer {
        let mut script = vec![MockResponse::new("500 Internal Server Error", "flaky"); times];
        script.push(MockResponse::ok(r#"{"ok":true}"#));
        MockServer::scripted(script)
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        for failures in 1..=4 {
            let server = failing(failures);
            let url = format!("{}/thing", server.base_url());
            let value: Value = HttpClient::new()
                .get_json(&url, &fast_retries())
                .await
                .expect("eventually succeeds");
            assert_eq!(value, json!({"ok": true}));
            assert_eq!(server.captured().len(), failures + 1);
        }
    }

    #[tokio::test]
    async fn gives_up_after_five_attempts() {
        let server = MockServer::scripted(vec![MockResponse::new(
            "503 Service Unavailable",
            "down for maintenance",
        )]);
        let url = format!("{}/thing", server.base_url());

        let err = HttpClient::new()
            .get_json::<Value>(&url, &fast_retries())
            .await
            .expect_err("always failing");
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.body(), Some("down for maintenance"));
        assert!(err.to_string().contains("GET"));
        assert_eq!(server.captured().len(), 5);
    }

    #[tokio::test]
    async fn once_does_not_retry() {
        let server = MockServer::scripted(vec![MockResponse::new("500 Internal Server Error", "")]);
        let url = format!("{}/thing", server.base_url());
        let _ = HttpClient::new()
            .get_text(&url, &RequestOptions::once())
            .await
            .expect_err("fails");
        assert_eq!(server.captured().len(), 1);
    }

    #[tokio::test]
    async fn final_status_stops_retrying() {
        let server = MockServer::scripted(vec![MockResponse::new("404 Not Found", "gone")]);
        let url = format!("{}/thing", server.base_url());
        let err = HttpClient::new()
            .delete(&url, &fast_retries().with_final_status(404))
            .await
            .expect_err("not found");
        assert!(err.is_not_found());
        assert_eq!(server.captured().len(), 1);
    }

    #[tokio::test]
    async fn network_errors_are_retried_and_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpClient::new()
            .get_text(
                &format!("http://{addr}/status"),
                &RequestOptions::default().with_retries(1, Duration::from_millis(5)),
            )
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, HttpError::Request { .. }));
    }

    #[tokio::test]
    async fn post_sends_json_with_auth_and_headers() {
        let (base_url, rx) = spawn_one_shot_server("201 Created", r#"{"id":"abc"}"#);
        let opts = RequestOptions::once()
            .with_bearer("tok")
            .with_header("x-trace", "1");

        let value: Value = HttpClient::new()
            .post_json(&format!("{base_url}/items"), &json!({"name": "x"}), &opts)
            .await
            .expect("post succeeds");
        assert_eq!(value["id"], "abc");

        let req = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("captured request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/items");
        assert_eq!(req.header("authorization"), Some("Bearer tok"));
        assert_eq!(req.header("x-trace"), Some("1"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(body["name"], "x");
    }

    #[tokio::test]
    async fn empty_success_body_decodes_as_null() {
        let (base_url, _rx) = spawn_one_shot_server("200 OK", "");
        let value: Value = HttpClient::new()
            .get_json(&base_url, &RequestOptions::once())
            .await
            .expect("empty body is fine");
        assert_eq!(value, Value::Null);
    }
}
