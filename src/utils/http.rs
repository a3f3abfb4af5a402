use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{MerseError, Result};

const MAX_ERROR_BODY_BYTES: usize = 16 * 1024;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let (bytes, truncated) = response_bytes_truncated(response, max_bytes).await;
    let mut body = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Reads at most `max_bytes` of the body and stops pulling chunks once the cap
/// is reached.
async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> (Vec<u8>, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    (out, truncated)
}

/// Sends the request and turns any non-2xx status into [`MerseError::Api`].
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(MerseError::Api { status, body });
    }
    Ok(response)
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    let raw = response.text().await?;
    serde_json::from_str(&raw)
        .map_err(|err| MerseError::InvalidResponse(format!("{err}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::should_skip_httpmock;
    use httpmock::Method::GET;
    use httpmock::MockServer;

    #[tokio::test]
    async fn error_bodies_are_capped_while_reading() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/huge");
            then.status(502).body("x".repeat(64 * 1024));
        });

        let response = reqwest::get(format!("{}/huge", server.base_url()))
            .await
            .expect("send");
        let (bytes, truncated) = response_bytes_truncated(response, 1024).await;
        assert_eq!(bytes.len(), 1024);
        assert!(truncated);
    }

    #[tokio::test]
    async fn send_checked_reports_truncated_error_body() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/huge");
            then.status(500).body("y".repeat(MAX_ERROR_BODY_BYTES * 2));
        });

        let client = reqwest::Client::new();
        let err = send_checked(client.get(format!("{}/huge", server.base_url())))
            .await
            .expect_err("non-2xx");
        let MerseError::Api { status, body } = err else {
            panic!("expected api error, got {err:?}");
        };
        assert_eq!(status.as_u16(), 500);
        assert!(body.ends_with("...(truncated)"));
        assert!(body.len() < MAX_ERROR_BODY_BYTES + 32);
    }

    #[tokio::test]
    async fn short_bodies_are_returned_whole() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/small");
            then.status(400).body("bad request");
        });

        let response = reqwest::get(format!("{}/small", server.base_url()))
            .await
            .expect("send");
        assert_eq!(
            response_text_truncated(response, MAX_ERROR_BODY_BYTES).await,
            "bad request"
        );
    }
}
