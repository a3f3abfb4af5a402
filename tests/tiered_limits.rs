use std::sync::Arc;

use httpmock::Method::POST;
use httpmock::MockServer;
use merse_credits::limits::{
    RemoteCounter, Resource, RestCounter, TieredDecision, TieredRateLimiter,
};
use merse_credits::observability::Observability;
use merse_credits::utils::test_support::should_skip_httpmock;
use serde_json::json;

fn limiter(base_url: String, observability: Arc<Observability>) -> TieredRateLimiter {
    let counter = RestCounter::new(base_url, "tok").expect("counter");
    TieredRateLimiter::new(Some(Arc::new(counter) as Arc<dyn RemoteCounter>), observability)
        .with_prefix("merse")
}

#[tokio::test]
async fn enterprise_caller_is_counted_under_enterprise_key() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/pipeline")
            .header("authorization", "Bearer tok")
            .json_body(json!([
                ["INCR", "merse:object:enterprise:studio-7"],
                ["EXPIRE", "merse:object:enterprise:studio-7", 60, "NX"]
            ]));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([{"result": 60}, {"result": 1}]));
    });

    let observability = Arc::new(Observability::default());
    let limiter = limiter(server.base_url(), observability.clone());
    let decision = limiter
        .check(Resource::Object, Some("Enterprise Pro"), "studio-7")
        .await;

    mock.assert();
    let TieredDecision::Allowed { headers } = decision else {
        panic!("expected allowed, got {decision:?}");
    };
    assert_eq!(headers.limit, 60);
    assert_eq!(headers.remaining, 0);
    assert_eq!(observability.snapshot().rate_limited, 0);
}

#[tokio::test]
async fn over_limit_count_is_denied() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/pipeline");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([{"result": "4"}, {"result": 0}]));
    });

    let observability = Arc::new(Observability::default());
    let limiter = limiter(server.base_url(), observability.clone());
    let decision = limiter.check(Resource::Video, None, "ip-1").await;

    assert!(!decision.is_allowed());
    assert_eq!(decision.headers().map(|headers| headers.limit), Some(3));
    assert_eq!(observability.snapshot().rate_limited, 1);
}

#[tokio::test]
async fn counter_outage_fails_open() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/pipeline");
        then.status(503).body("maintenance");
    });

    let observability = Arc::new(Observability::default());
    let limiter = limiter(server.base_url(), observability.clone());
    for _ in 0..3 {
        let decision = limiter.check(Resource::Image, Some("pro"), "ip-1").await;
        assert_eq!(decision, TieredDecision::FailOpen);
    }
    assert_eq!(observability.snapshot().limiter_fail_open, 3);
}

#[tokio::test]
async fn malformed_reply_fails_open() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/pipeline");
        then.status(200)
            .header("content-type", "application/json")
            .body("{\"not\":\"an array\"}");
    });

    let observability = Arc::new(Observability::default());
    let limiter = limiter(server.base_url(), observability.clone());
    let decision = limiter.check(Resource::Site, None, "ip-1").await;
    assert_eq!(decision, TieredDecision::FailOpen);
    assert!(decision.headers().is_none());
}
