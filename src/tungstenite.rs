use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

use crate::{
    frame::Payload,
    interceptor::{ReadyState, Socket, SocketFactory},
};

/// Opens real `ws://` and `wss://` connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteFactory;

impl TungsteniteFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketFactory for TungsteniteFactory {
    type Socket = TungsteniteSocket;

    async fn connect(&self, url: &str) -> anyhow::Result<TungsteniteSocket> {
        ensure_rustls_crypto_provider()?;
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| anyhow::anyhow!("connect {url}: {err}"))?;
        tracing::debug!(socket_url = url, status = %response.status(), "websocket connected");
        Ok(TungsteniteSocket {
            url: url.to_owned(),
            stream,
            state: ReadyState::Open,
        })
    }
}

pub struct TungsteniteSocket {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ReadyState,
}

#[async_trait]
impl Socket for TungsteniteSocket {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    async fn send(&mut self, payload: Payload) -> anyhow::Result<()> {
        if self.state != ReadyState::Open {
            anyhow::bail!("send on {} while {:?}", self.url, self.state);
        }
        let message = match payload {
            Payload::Text(text) => Message::text(text),
            Payload::Binary(bytes) => Message::binary(bytes),
        };
        self.stream
            .send(message)
            .await
            .map_err(|err| anyhow::anyhow!("send to {}: {err}", self.url))
    }

    async fn recv(&mut self) -> Option<anyhow::Result<Payload>> {
        if self.state == ReadyState::Closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(Payload::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(Payload::Binary(bytes.to_vec()))),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(socket_url = %self.url, ?frame, "peer closed websocket");
                    self.state = ReadyState::Closing;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    self.state = ReadyState::Closed;
                    return None;
                }
                Some(Err(err)) => {
                    return Some(Err(anyhow::anyhow!("receive from {}: {err}", self.url)));
                }
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.state == ReadyState::Closed {
            return Ok(());
        }
        self.state = ReadyState::Closing;
        let result = match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(anyhow::anyhow!("close {}: {err}", self.url)),
        };
        self.state = ReadyState::Closed;
        result
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}
