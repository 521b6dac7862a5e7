mod common;

use common::serve_canned_http;
use mewld::core::MewldError;
use mewld::core::gateway::get_gateway_info;

#[tokio::test(flavor = "multi_thread")]
async fn test_gateway_info_is_fetched_and_decoded() {
    let body = r#"{
        "url": "wss://gateway.example",
        "shards": 12,
        "session_start_limit": {
            "total": 1000,
            "remaining": 997,
            "reset_after": 3600000,
            "max_concurrency": 1
        }
    }"#;
    let url = serve_canned_http("200 OK", body.to_string()).await;

    let info = get_gateway_info(&url, "token").await.unwrap();
    assert_eq!(info.shards, 12);
    assert_eq!(info.session_start_limit.remaining, 997);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_200_status_is_an_auth_error() {
    let url = serve_canned_http("401 Unauthorized", "{}".to_string()).await;

    let err = get_gateway_info(&url, "bad-token").await.unwrap_err();
    match err {
        MewldError::Auth(status) => assert_eq!(status, 401),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_json_is_a_decode_error() {
    let url = serve_canned_http("200 OK", "not json".to_string()).await;

    let err = get_gateway_info(&url, "token").await.unwrap_err();
    assert!(matches!(err, MewldError::Decode(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_gateway_is_a_transport_error() {
    // Nothing listens on the discard port.
    let err = get_gateway_info("http://127.0.0.1:9/", "token")
        .await
        .unwrap_err();
    assert!(matches!(err, MewldError::Transport(_)));
}
