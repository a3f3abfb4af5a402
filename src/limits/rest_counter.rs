use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::RateLimitError;
use super::tiered::RemoteCounter;
use crate::utils::http::send_checked_json;

/// Counter reached over a Redis-compatible REST endpoint that accepts
/// pipelined commands (`POST {url}/pipeline`).
#[derive(Clone)]
pub struct RestCounter {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl std::fmt::Debug for RestCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCounter")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct PipelineReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RestCounter {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Builds a counter only when both URL and token are present and non-blank.
    pub fn from_parts(url: Option<&str>, token: Option<&str>) -> crate::Result<Option<Self>> {
        let url = crate::utils::non_empty(url);
        let token = crate::utils::non_empty(token);
        match (url, token) {
            (Some(url), Some(token)) => Self::new(url, token).map(Some),
            _ => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn count_from_result(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl RemoteCounter for RestCounter {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<u64, RateLimitError> {
        let body = json!([["INCR", key], ["EXPIRE", key, window_secs, "NX"]]);
        let req = self
            .http
            .post(format!("{}/pipeline", self.url))
            .bearer_auth(&self.token)
            .json(&body);

        let replies: Vec<PipelineReply> = send_checked_json(req)
            .await
            .map_err(RateLimitError::backend)?;

        let first = replies
            .first()
            .ok_or_else(|| RateLimitError::backend("empty pipeline response"))?;
        if let Some(error) = first.error.as_deref() {
            return Err(RateLimitError::backend(format!("INCR failed: {error}")));
        }
        first
            .result
            .as_ref()
            .and_then(count_from_result)
            .ok_or_else(|| RateLimitError::backend("INCR returned a non-integer result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::should_skip_httpmock;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    #[test]
    fn blank_configuration_disables_the_counter() {
        assert!(
            RestCounter::from_parts(Some("  "), Some("token"))
                .expect("build")
                .is_none()
        );
        assert!(
            RestCounter::from_parts(Some("https://counter"), None)
                .expect("build")
                .is_none()
        );
        let counter = RestCounter::from_parts(Some("https://counter/"), Some("t"))
            .expect("build")
            .expect("enabled");
        assert_eq!(counter.url(), "https://counter");
    }

    #[tokio::test]
    async fn increment_posts_pipeline_and_reads_first_result() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/pipeline")
                .header("authorization", "Bearer secret")
                .json_body(json!([
                    ["INCR", "ratelimit:image:pro:ip-1"],
                    ["EXPIRE", "ratelimit:image:pro:ip-1", 60, "NX"]
                ]));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([{"result": 7}, {"result": 0}]));
        });

        let counter = RestCounter::new(server.base_url(), "secret").expect("counter");
        let count = counter
            .increment("ratelimit:image:pro:ip-1", 60)
            .await
            .expect("increment");
        assert_eq!(count, 7);
        mock.assert();
    }

    #[tokio::test]
    async fn error_status_is_backend_unavailable() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/pipeline");
            then.status(500).body("boom");
        });

        let counter = RestCounter::new(server.base_url(), "secret").expect("counter");
        let err = counter.increment("k", 60).await.expect_err("should fail");
        assert!(matches!(err, RateLimitError::CounterBackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn command_error_is_backend_unavailable() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/pipeline");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([{"error": "WRONGTYPE"}, {"result": 0}]));
        });

        let counter = RestCounter::new(server.base_url(), "secret").expect("counter");
        let err = counter.increment("k", 60).await.expect_err("should fail");
        assert!(err.to_string().contains("WRONGTYPE"));
    }
}
