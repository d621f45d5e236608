use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc};
use wsinspect::{
    bridge::PageChannel,
    frame::Payload,
    interceptor::{Interceptor, ReadyState, Socket, SocketFactory},
    tungstenite::TungsteniteFactory,
};

/// Accepts one connection and echoes text and binary messages back.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("echo listener should bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(message)) = ws.next().await {
            if message.is_text() || message.is_binary() {
                if ws.send(message).await.is_err() {
                    break;
                }
            } else if message.is_close() {
                break;
            }
        }
    });
    addr
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn tapped_websocket_round_trip_reports_every_frame() {
    let addr = spawn_echo_server().await;
    let url = format!("ws://{addr}/ws");
    let (page, mut page_rx) = PageChannel::new();
    let interceptor = Interceptor::new(TungsteniteFactory::new(), page)
        .with_listen_url_fragment(Some("/ws".to_owned()))
        .with_tab_url(Some("https://a.test".to_owned()));

    let mut socket = interceptor.connect(&url).await.expect("connect to echo server");
    assert!(socket.is_tapped());
    assert_eq!(socket.ready_state(), ReadyState::Open);

    socket.send(Payload::from("hello")).await.expect("send text");
    assert_eq!(
        socket.recv().await.expect("echo").expect("payload"),
        Payload::from("hello")
    );
    socket
        .send(Payload::Binary(vec![0xde, 0xad]))
        .await
        .expect("send binary");
    assert_eq!(
        socket.recv().await.expect("echo").expect("payload"),
        Payload::Binary(vec![0xde, 0xad])
    );
    socket.close().await.expect("close");
    assert_eq!(socket.ready_state(), ReadyState::Closed);

    let messages = drain(&mut page_rx);
    let summary: Vec<(&str, &str)> = messages
        .iter()
        .map(|m| {
            (
                m["kind"].as_str().unwrap_or_default(),
                m["payload"].as_str().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            ("connection-opened", ""),
            ("frame-sent", "hello"),
            ("frame-received", "hello"),
            ("frame-sent", "3q0="),
            ("frame-received", "3q0="),
            ("connection-closed", ""),
        ]
    );
    assert!(messages.iter().all(|m| m["socketUrl"] == url.as_str()));
}

#[tokio::test]
async fn untapped_websocket_behaves_like_the_plain_socket() {
    let addr = spawn_echo_server().await;
    let url = format!("ws://{addr}/feed");
    let (page, mut page_rx) = PageChannel::new();
    let interceptor = Interceptor::new(TungsteniteFactory::new(), page)
        .with_listen_url_fragment(Some("/inspect".to_owned()));

    let mut socket = interceptor.connect(&url).await.expect("connect to echo server");
    assert!(!socket.is_tapped());
    assert_eq!(socket.url(), url);

    socket.send(Payload::from("ping")).await.expect("send");
    assert_eq!(
        socket.recv().await.expect("echo").expect("payload"),
        Payload::from("ping")
    );
    socket.close().await.expect("close");

    assert!(drain(&mut page_rx).is_empty());
}
