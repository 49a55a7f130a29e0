use super::*;
use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::time::Duration;
use tokio::net::TcpListener;

async fn echo_handler(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        if let AxumMessage::Text(text) = msg {
            if text == "bye" {
                let _ = socket.send(AxumMessage::Close(None)).await;
                return;
            }
            if socket
                .send(AxumMessage::Text(format!("echo:{text}")))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn spawn_echo_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/api/ws/events", get(echo_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/api/ws/events?token=secret")
}

#[tokio::test]
async fn relays_text_frames_both_ways_and_reports_close() {
    let url = Url::parse(&spawn_echo_server().await).expect("url");
    let mut connection = WebSocketConnector.open(&url).await.expect("open");

    connection.outbound.send("ping".to_string()).expect("send");
    let reply = tokio::time::timeout(Duration::from_secs(5), connection.inbound.recv())
        .await
        .expect("reply in time");
    assert_eq!(reply.as_deref(), Some("echo:ping"));

    connection.outbound.send("bye".to_string()).expect("send");
    let closed = tokio::time::timeout(Duration::from_secs(5), connection.inbound.recv())
        .await
        .expect("close in time");
    assert_eq!(closed, None);
}

#[tokio::test]
async fn connect_failure_hides_the_token() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/api/ws/events?token=secret")).expect("url");
    let err = match WebSocketConnector.open(&url).await {
        Ok(_) => panic!("connect must fail"),
        Err(err) => err,
    };
    match err {
        TransportError::Connect { url, .. } => assert!(!url.contains("secret")),
        other => panic!("unexpected error: {other:?}"),
    }
}
