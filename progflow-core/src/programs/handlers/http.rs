use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::HttpSettings;
use crate::programs::registry::{ActionHandler, ActionInvocation, HandlerError};
use crate::programs::types::Step;

/// `call_external`: one HTTP request with a bounded response body.
#[derive(Debug, Clone)]
pub struct CallExternalAction {
    settings: HttpSettings,
    client: reqwest::Client,
}

impl CallExternalAction {
    pub fn new(settings: HttpSettings) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { settings, client }
    }

    fn method_from_params(params: &Value) -> Result<Method, HandlerError> {
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .trim()
            .to_ascii_uppercase();

        Method::from_bytes(method.as_bytes())
            .map_err(|err| HandlerError::InvalidParams(format!("invalid HTTP method '{method}': {err}")))
    }

    fn url_from_params(params: &Value) -> Result<&str, HandlerError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidParams("missing 'url' parameter".to_owned()))?;
        if url.trim().is_empty() {
            return Err(HandlerError::InvalidParams("url must be non-empty".to_owned()));
        }
        Ok(url)
    }

    fn parse_headers(params: &Value) -> Result<HeaderMap, HandlerError> {
        let mut headers = HeaderMap::new();
        let Some(raw_headers) = params.get("headers") else {
            return Ok(headers);
        };
        let Some(map) = raw_headers.as_object() else {
            return Err(HandlerError::InvalidParams("'headers' must be an object".to_owned()));
        };

        for (name, value) in map {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                HandlerError::InvalidParams(format!("invalid header name '{name}': {err}"))
            })?;
            let raw_value = value.as_str().ok_or_else(|| {
                HandlerError::InvalidParams(format!("header '{name}' value must be a string"))
            })?;
            let header_value = HeaderValue::from_str(raw_value).map_err(|err| {
                HandlerError::InvalidParams(format!("invalid value for header '{name}': {err}"))
            })?;
            headers.insert(header_name, header_value);
        }

        Ok(headers)
    }

    fn timeout(&self, params: &Value) -> Result<Duration, HandlerError> {
        let seconds = params
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(self.settings.timeout_seconds);
        if seconds == 0 {
            return Err(HandlerError::InvalidParams(
                "timeout_seconds must be greater than zero".to_owned(),
            ));
        }
        Ok(Duration::from_secs(seconds))
    }

    async fn send(&self, params: &Value) -> Result<Value, HandlerError> {
        let method = Self::method_from_params(params)?;
        let url = Self::url_from_params(params)?.to_owned();
        let headers = Self::parse_headers(params)?;
        let timeout = self.timeout(params)?;
        let allow_error_status = params
            .get("allow_error_status")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut request = self.client.request(method.clone(), &url);
        if !headers.is_empty() {
            request = request.headers(headers);
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                HandlerError::Failed(format!(
                    "HTTP request timed out after {} seconds",
                    timeout.as_secs()
                ))
            })?
            .map_err(|err| HandlerError::Failed(format!("HTTP request failed: {err}")))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let mut received = 0usize;
        let mut body_bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| HandlerError::Failed(format!("failed reading response body: {err}")))?;
            received += chunk.len();
            if received > self.settings.max_response_bytes {
                return Err(HandlerError::Failed(format!(
                    "response body exceeded size limit ({} bytes)",
                    self.settings.max_response_bytes
                )));
            }
            body_bytes.extend_from_slice(&chunk);
        }

        if !status.is_success() && !allow_error_status {
            return Err(HandlerError::Failed(format!(
                "{} {url} returned HTTP {}",
                method.as_str(),
                status.as_u16()
            )));
        }

        let parsed_json = if content_type.to_ascii_lowercase().contains("application/json") {
            serde_json::from_slice::<Value>(&body_bytes).ok()
        } else {
            None
        };

        Ok(json!({
            "method": method.as_str(),
            "url": url,
            "status": status.as_u16(),
            "ok": status.is_success(),
            "content_type": content_type,
            "body": String::from_utf8_lossy(&body_bytes),
            "json": parsed_json,
        }))
    }
}

#[async_trait]
impl ActionHandler for CallExternalAction {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, HandlerError> {
        tokio::select! {
            biased;
            _ = invocation.cancel.cancelled() => Err(HandlerError::Cancelled),
            result = self.send(&invocation.params) => result,
        }
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let params = &step.action.params;
        let mut issues = Vec::new();
        if let Err(err) = Self::url_from_params(params) {
            issues.push(err.to_string());
        }
        if let Err(err) = Self::method_from_params(params) {
            issues.push(err.to_string());
        }
        if let Err(err) = Self::parse_headers(params) {
            issues.push(err.to_string());
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::types::{ActionType, PersonalityConfig, StepType};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    fn step(params: Value) -> Step {
        Step::new("call", StepType::Custom("webhook".to_owned()), ActionType::CallExternal)
            .with_params(params)
    }

    #[test]
    fn validation_reports_missing_url_and_bad_headers() {
        let action = CallExternalAction::new(HttpSettings::default());
        let issues = action.validate(&step(json!({"headers": {"x-id": 7}})));
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("url"));

        assert!(action
            .validate(&step(json!({"url": "https://example.test/hook", "method": "post"})))
            .is_empty());
    }

    fn invocation(params: Value, cancel: CancellationToken) -> ActionInvocation {
        ActionInvocation {
            run_id: "run".to_owned(),
            tenant_id: "t".to_owned(),
            user_id: None,
            step_id: "call".to_owned(),
            attempt: 1,
            params,
            variables: Arc::new(BTreeMap::new()),
            knowledge: Vec::new(),
            use_personality: false,
            personality: PersonalityConfig::default(),
            now: chrono::Utc::now(),
            cancel,
        }
    }

    fn http_response(status_line: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn request_complete(received: &[u8]) -> bool {
        let Some(header_end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&received[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        received.len() >= header_end + 4 + content_length
    }

    /// Serves one connection with a canned `response` (or holds it open
    /// without answering when `None`) and hands back the raw request.
    async fn serve_once(response: Option<String>) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, request_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !request_complete(&received) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let _ = request_tx.send(String::from_utf8_lossy(&received).into_owned());
            match response {
                Some(response) => {
                    socket.write_all(response.as_bytes()).await.unwrap();
                    socket.shutdown().await.ok();
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });
        (format!("http://{addr}"), request_rx)
    }

    #[tokio::test]
    async fn post_captures_status_headers_and_json_body() {
        let (base, request) = serve_once(Some(http_response(
            "201 Created",
            "application/json",
            r#"{"id":42}"#,
        )))
        .await;
        let action = CallExternalAction::new(HttpSettings::default());

        let output = action
            .execute(invocation(
                json!({
                    "url": format!("{base}/hook"),
                    "method": "post",
                    "headers": {"x-trace": "abc"},
                    "body": {"name": "Ada"},
                }),
                CancellationToken::new(),
            ))
            .await
            .unwrap();

        assert_eq!(output["status"], 201);
        assert_eq!(output["ok"], true);
        assert_eq!(output["method"], "POST");
        assert_eq!(output["json"]["id"], 42);
        assert_eq!(output["body"], r#"{"id":42}"#);

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /hook HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("x-trace: abc"));
        assert!(request.ends_with(r#"{"name":"Ada"}"#));
    }

    #[tokio::test]
    async fn error_status_fails_unless_allowed() {
        let action = CallExternalAction::new(HttpSettings::default());

        let (base, _request) =
            serve_once(Some(http_response("503 Service Unavailable", "text/plain", "down"))).await;
        let err = action
            .execute(invocation(json!({"url": base}), CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(&err, HandlerError::Failed(message) if message.contains("503")));

        let (base, _request) =
            serve_once(Some(http_response("503 Service Unavailable", "text/plain", "down"))).await;
        let output = action
            .execute(invocation(
                json!({"url": base, "allow_error_status": true}),
                CancellationToken::new(),
            ))
            .await
            .unwrap();
        assert_eq!(output["status"], 503);
        assert_eq!(output["ok"], false);
        assert_eq!(output["body"], "down");
        assert!(output["json"].is_null());
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let body = "x".repeat(64);
        let (base, _request) = serve_once(Some(http_response("200 OK", "text/plain", &body))).await;
        let action = CallExternalAction::new(HttpSettings {
            max_response_bytes: 16,
            ..HttpSettings::default()
        });

        let err = action
            .execute(invocation(json!({"url": base}), CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(&err, HandlerError::Failed(message) if message.contains("size limit")));
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let (base, _request) = serve_once(None).await;
        let action = CallExternalAction::new(HttpSettings::default());

        let err = action
            .execute(invocation(
                json!({"url": base, "timeout_seconds": 1}),
                CancellationToken::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(&err, HandlerError::Failed(message) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn cancelled_invocation_does_not_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = CallExternalAction::new(HttpSettings::default())
            .execute(invocation(json!({"url": "http://10.255.255.1/never"}), cancel))
            .await;
        assert_eq!(result, Err(HandlerError::Cancelled));
    }
}
