
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harness::{request_bytes, BackendBehavior, RdpBackend, X224_CONFIRM, X224_REQUEST};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webrdp_gateway::{server, Gateway, SessionConfig};
use webrdp_wire::CleanPathPdu;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn websocket_session_end_to_end() {
    let backend = RdpBackend::spawn("rdp.example.test", BackendBehavior::Rdp, X224_REQUEST.len())
        .await
        .unwrap();

    let web_root = std::env::temp_dir().join(format!("webrdp-ws-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&web_root).unwrap();

    let shutdown = CancellationToken::new();
    let gateway = Gateway::new(SessionConfig::default()).unwrap();
    let app = server::create_router(gateway, shutdown.clone(), &web_root);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(server::serve(listener, app, shutdown.clone()));

    let (ws_stream, _) = timeout(
        TEST_TIMEOUT,
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws")),
    )
    .await
    .expect("connect timed out")
    .unwrap();
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let request = request_bytes(&backend.addr.to_string(), None, X224_REQUEST);
    ws_write.send(Message::Binary(request.into())).await.unwrap();

    // The response arrives as a single binary message.
    let response = match timeout(TEST_TIMEOUT, ws_read.next()).await.unwrap() {
        Some(Ok(Message::Binary(data))) => CleanPathPdu::decode(&data).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(response.x224_connection_pdu.as_deref(), Some(X224_CONFIRM));
    assert_eq!(response.server_cert_chain.unwrap()[0], backend.cert_der);
    assert_eq!(response.server_addr, Some(backend.addr.to_string()));

    ws_write
        .send(Message::Binary(b"client-hello".to_vec().into()))
        .await
        .unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < b"client-hello".len() {
        match timeout(TEST_TIMEOUT, ws_read.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => echoed.extend_from_slice(&data),
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(echoed, b"client-hello");

    // Shutting the server down tears the live session down too.
    shutdown.cancel();
    loop {
        match timeout(TEST_TIMEOUT, ws_read.next())
            .await
            .expect("session was not closed")
        {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }

    timeout(TEST_TIMEOUT, server_task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
