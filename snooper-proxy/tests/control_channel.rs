//! Control channel integration: module registration over WebSocket and
//! event delivery for observed traffic.

mod helpers;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use snooper_proxy::proxy::SnooperOptions;

use helpers::{spawn_proxy, MockUpstream};

const BLOCK_NUMBER_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0x1234"}"#;

async fn next_json(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("control channel idle")
            .expect("control channel closed")
            .expect("control channel error");

        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("invalid control frame");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_snooper_module_and_receive_hook_events() {
    let upstream = MockUpstream::new()
        .with_response("eth_blockNumber", BLOCK_NUMBER_RESPONSE)
        .start()
        .await;

    let (snooper, addr, _server) = spawn_proxy(
        &upstream.url(),
        SnooperOptions {
            color: false,
            ..Default::default()
        },
    )
    .await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/_snooper/control"))
        .await
        .expect("control channel connect");

    // Register a request snooper for JSON POST traffic.
    let register = json!({
        "reqid": 1,
        "method": "register_module",
        "data": {
            "type": "request_snooper",
            "name": "test-snooper",
            "config": {
                "request_filter": {"methods": ["POST"], "content_types": ["json"]},
            },
        },
        "time": 0,
    });
    socket
        .send(Message::Text(register.to_string().into()))
        .await
        .unwrap();

    let response = next_json(&mut socket).await;
    assert_eq!(response["rspid"], json!(1));
    assert_eq!(response["data"]["success"], json!(true));
    let module_id = response["data"]["module_id"].as_u64().expect("module id");
    assert!(module_id >= 1);
    assert_eq!(snooper.modules().module_count(), 1);

    // Proxy a call; the module mirrors the request body.
    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/"))
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#)
        .send()
        .await
        .unwrap();

    let hook = next_json(&mut socket).await;
    assert_eq!(hook["method"], json!("hook_event"));
    assert_eq!(hook["modid"], json!(module_id));
    assert_eq!(hook["data"]["hook_type"], json!("request"));
    assert_eq!(hook["data"]["data"]["method"], json!("eth_blockNumber"));

    // Unregister and confirm the registry empties.
    let unregister = json!({
        "reqid": 2,
        "method": "unregister_module",
        "data": module_id,
        "time": 0,
    });
    socket
        .send(Message::Text(unregister.to_string().into()))
        .await
        .unwrap();

    let response = next_json(&mut socket).await;
    assert_eq!(response["rspid"], json!(2));
    assert_eq!(response["data"]["success"], json!(true));
    assert_eq!(snooper.modules().module_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_module_type_is_rejected() {
    let upstream = MockUpstream::new().start().await;
    let (_snooper, addr, _server) = spawn_proxy(
        &upstream.url(),
        SnooperOptions {
            color: false,
            ..Default::default()
        },
    )
    .await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/_snooper/control"))
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({
                "reqid": 1,
                "method": "register_module",
                "data": {"type": "mystery_module", "name": "x", "config": {}},
                "time": 0,
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let response = next_json(&mut socket).await;
    assert_eq!(response["rspid"], json!(1));
    assert!(
        response["error"]
            .as_str()
            .unwrap()
            .contains("Unknown module type"),
        "unexpected response: {response}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_unregisters_connection_modules() {
    let upstream = MockUpstream::new().start().await;
    let (snooper, addr, _server) = spawn_proxy(
        &upstream.url(),
        SnooperOptions {
            color: false,
            ..Default::default()
        },
    )
    .await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/_snooper/control"))
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({
                "reqid": 1,
                "method": "register_module",
                "data": {"type": "request_counter", "name": "c", "config": {}},
                "time": 0,
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let response = next_json(&mut socket).await;
    assert_eq!(response["data"]["success"], json!(true));
    assert_eq!(snooper.modules().module_count(), 1);

    drop(socket);

    let emptied = helpers::wait_until(Duration::from_secs(3), || {
        snooper.modules().module_count() == 0
    })
    .await;
    assert!(emptied, "modules were not unregistered on disconnect");
}
