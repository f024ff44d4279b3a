use crate::credentials::CredentialSource;
use crate::error::StreamError;
use crate::protocol::Message;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capability announcement sent with every upstream call.
pub const UPSTREAM_TOOLS: &[&str] = &["image_generation"];

const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("priority", "u=1, i"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"129\", \"Not=A?Brand\";v=\"8\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    ("x-app-id", "web"),
];

#[derive(Debug, Serialize)]
pub struct UpstreamPayload<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'static [&'static str],
}

impl<'a> UpstreamPayload<'a> {
    pub fn new(model: &'a str, messages: &'a [Message]) -> Self {
        Self {
            model,
            messages,
            tools: UPSTREAM_TOOLS,
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    device_id: String,
    credentials: Arc<dyn CredentialSource>,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        device_id: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            device_id: device_id.into(),
            credentials,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issues the single upstream POST. The credential is loaded first, so a
    /// missing cookie fails before any network I/O. Cancellation is honoured
    /// while connecting and while reading an error body.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        model: &str,
        messages: &[Message],
    ) -> Result<reqwest::Response, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let cookie = self.credentials.load().await?;
        let req = self.build_request(&cookie, model, messages);

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            resp = req.send() => resp.map_err(|err| {
                tracing::error!(url = %self.url, "upstream request failed: {err}");
                StreamError::UpstreamRequestFailed(err.to_string())
            })?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                text = resp.text() => text.unwrap_or_default(),
            };
            tracing::error!(url = %self.url, status = %status, "upstream rejected request");
            return Err(StreamError::UpstreamRequestFailed(format!(
                "upstream status {}: {}",
                status, text
            )));
        }
        Ok(resp)
    }

    fn build_request(
        &self,
        cookie: &str,
        model: &str,
        messages: &[Message],
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .json(&UpstreamPayload::new(model, messages));
        for (k, v) in BROWSER_HEADERS {
            req = req.header(*k, *v);
        }
        req.header("x-device-id", &self.device_id)
            .header(reqwest::header::COOKIE, cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::{UpstreamClient, UpstreamPayload};
    use crate::credentials::StaticCredential;
    use crate::error::StreamError;
    use crate::protocol::Message;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn client(cookie: &str) -> UpstreamClient {
        UpstreamClient::new(
            reqwest::Client::new(),
            // Port 9 (discard) is never reached by these tests.
            "http://127.0.0.1:9/api/v3/chat/completions",
            "device-1",
            Arc::new(StaticCredential(cookie.to_string())),
        )
    }

    fn messages() -> Vec<Message> {
        vec![Message {
            role: "user".to_string(),
            content: "Hello".to_string(),
        }]
    }

    #[test]
    fn payload_announces_image_generation_tool() {
        let messages = messages();
        let v = serde_json::to_value(UpstreamPayload::new("meta/llama3.1-8b", &messages)).unwrap();
        assert_eq!(
            v,
            json!({
                "model": "meta/llama3.1-8b",
                "messages": [{ "role": "user", "content": "Hello" }],
                "tools": ["image_generation"]
            })
        );
    }

    #[test]
    fn request_carries_browser_headers_and_cookie() {
        let messages = messages();
        let req = client("session=abc")
            .build_request("session=abc", "m", &messages)
            .build()
            .unwrap();
        let headers = req.headers();
        assert_eq!(headers["cookie"], "session=abc");
        assert_eq!(headers["x-device-id"], "device-1");
        assert_eq!(headers["x-app-id"], "web");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(req.method(), reqwest::Method::POST);
    }

    #[tokio::test]
    async fn missing_credential_fails_before_network() {
        let err = client("  ")
            .call(&CancellationToken::new(), "m", &messages())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::CredentialUnavailable(_)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client("session=abc")
            .call(&cancel, "m", &messages())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Cancelled));
    }
}
