//! End-to-end event pipeline tests: observed engine API calls produce
//! decorated events with correlated request/response data.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use snooper_core::events::get_blobs::EngineGetBlobsHandler;
use snooper_core::events::new_payload::EngineNewPayloadHandler;
use snooper_core::events::publisher::tests_support::CapturePublisher;
use snooper_core::events::router::Router;
use snooper_core::events::types::EventData;
use snooper_proxy::builtin::EventsModule;
use snooper_proxy::proxy::SnooperOptions;

use helpers::{spawn_proxy, wait_until, MockUpstream};

fn options() -> SnooperOptions {
    SnooperOptions {
        color: false,
        ..Default::default()
    }
}

async fn proxy_with_capture(
    upstream_url: &str,
) -> (Arc<CapturePublisher>, std::net::SocketAddr) {
    let capture = Arc::new(CapturePublisher::default());

    let mut router = Router::new();
    router.register(Arc::new(EngineGetBlobsHandler::new(capture.clone())));
    router.register(Arc::new(EngineNewPayloadHandler::new(capture.clone())));

    let (snooper, addr, _server) = spawn_proxy(upstream_url, options()).await;

    let manager = snooper.modules();
    let module_id = manager.next_module_id();
    manager.register(
        Arc::new(EventsModule::new(module_id, Arc::new(router))),
        None,
    );

    (capture, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_payload_valid_publishes_event() {
    let upstream = MockUpstream::new()
        .with_response(
            "engine_newPayloadV3",
            r#"{"jsonrpc":"2.0","id":5,"result":{"status":"VALID","latestValidHash":"0xaa11"}}"#,
        )
        .start()
        .await;

    let (capture, addr) = proxy_with_capture(&upstream.url()).await;

    let request = json!({
        "jsonrpc": "2.0",
        "method": "engine_newPayloadV3",
        "params": [
            {
                "blockNumber": "0x10",
                "blockHash": "0xaa11",
                "parentHash": "0xbb22",
                "gasUsed": "0x5208",
                "gasLimit": "0x1c9c380",
                "transactions": ["0x01", "0x02", "0x03"],
            },
            ["0xv1", "0xv2"],
        ],
        "id": 5,
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(
        wait_until(Duration::from_secs(3), || !capture.events().is_empty()).await,
        "no event published"
    );

    let events = capture.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.name, "EXECUTION_ENGINE_NEW_PAYLOAD");
    assert_eq!(events[0].meta.client.implementation, "rpc-snooper");

    match &events[0].data {
        EventData::NewPayload(data) => {
            assert_eq!(data.method_version, "V3");
            assert_eq!(data.block_number, 16);
            assert_eq!(data.block_hash, "0xaa11");
            assert_eq!(data.parent_hash, "0xbb22");
            assert_eq!(data.tx_count, 3);
            assert_eq!(data.blob_count, 2);
            assert_eq!(data.status, "VALID");
            assert_eq!(data.latest_valid_hash, "0xaa11");
        }
        other => panic!("unexpected event payload: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_blobs_partial_publishes_event() {
    let upstream = MockUpstream::new()
        .with_response(
            "engine_getBlobsV1",
            r#"{"jsonrpc":"2.0","id":2,"result":[{"blob":"0x01"},null,{"blob":"0x03"}]}"#,
        )
        .start()
        .await;

    let (capture, addr) = proxy_with_capture(&upstream.url()).await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "engine_getBlobsV1",
            "params": [["0xh1", "0xh2", "0xh3"]],
            "id": 2,
        }))
        .send()
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || !capture.events().is_empty()).await,
        "no event published"
    );

    let events = capture.events();
    match &events[0].data {
        EventData::GetBlobs(data) => {
            assert_eq!(data.method_version, "V1");
            assert_eq!(data.requested_count, 3);
            assert_eq!(data.returned_count, 2);
            assert_eq!(data.status, "PARTIAL");
            assert_eq!(data.versioned_hashes, vec!["0xh1", "0xh2", "0xh3"]);
        }
        other => panic!("unexpected event payload: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rpc_error_response_publishes_error_status() {
    let upstream = MockUpstream::new()
        .with_response(
            "engine_newPayloadV2",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"payload rejected"}}"#,
        )
        .start()
        .await;

    let (capture, addr) = proxy_with_capture(&upstream.url()).await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "engine_newPayloadV2",
            "params": [{"blockHash": "0xcc"}],
            "id": 1,
        }))
        .send()
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || !capture.events().is_empty()).await,
        "no event published"
    );

    match &capture.events()[0].data {
        EventData::NewPayload(data) => {
            assert_eq!(data.status, "ERROR");
            assert_eq!(data.validation_error, "payload rejected");
            assert_eq!(data.method_version, "V2");
        }
        other => panic!("unexpected event payload: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unmatched_methods_publish_nothing() {
    let upstream = MockUpstream::new()
        .with_response("eth_blockNumber", r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
        .start()
        .await;

    let (capture, addr) = proxy_with_capture(&upstream.url()).await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "eth_blockNumber",
            "params": [],
            "id": 1,
        }))
        .send()
        .await
        .unwrap();

    // Give observation time to run, then confirm nothing was published.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(capture.events().is_empty());
}
