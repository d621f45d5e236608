use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Source tag stamped on every frame the interceptor posts into the page
/// channel. The bridge ignores page messages that do not carry it.
pub const INTERCEPTOR_SOURCE: &str = "wsinspect-interceptor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    ConnectionOpened,
    FrameSent,
    FrameReceived,
    ConnectionClosed,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection-opened",
            Self::FrameSent => "frame-sent",
            Self::FrameReceived => "frame-received",
            Self::ConnectionClosed => "connection-closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
    System,
}

/// Raw WebSocket message body as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Text payloads are kept verbatim; binary payloads are base64 encoded.
    pub fn to_frame_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// One captured WebSocket lifecycle event.
///
/// Frames are immutable once built. The single permitted change is
/// [`Frame::ensure_tab_url`], which fills in the owning tab URL if the
/// interceptor could not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    source: String,
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tab_url: Option<String>,
    timestamp: String,
    socket_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    direction: Option<Direction>,
    #[serde(default)]
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl Frame {
    pub fn connection_opened(socket_url: impl Into<String>) -> Self {
        Self::new(FrameKind::ConnectionOpened, socket_url.into(), None, String::new())
    }

    pub fn sent(socket_url: impl Into<String>, payload: &Payload) -> Self {
        Self::new(
            FrameKind::FrameSent,
            socket_url.into(),
            Some(Direction::Send),
            payload.to_frame_string(),
        )
    }

    pub fn received(socket_url: impl Into<String>, payload: &Payload) -> Self {
        Self::new(
            FrameKind::FrameReceived,
            socket_url.into(),
            Some(Direction::Receive),
            payload.to_frame_string(),
        )
    }

    pub fn connection_closed(socket_url: impl Into<String>) -> Self {
        Self::new(
            FrameKind::ConnectionClosed,
            socket_url.into(),
            Some(Direction::System),
            String::new(),
        )
    }

    fn new(
        kind: FrameKind,
        socket_url: String,
        direction: Option<Direction>,
        payload: String,
    ) -> Self {
        Self {
            source: INTERCEPTOR_SOURCE.to_owned(),
            kind,
            tab_url: None,
            timestamp: now_iso8601(),
            socket_url,
            direction,
            payload,
            correlation_id: None,
        }
    }

    pub fn with_tab_url(mut self, tab_url: impl Into<String>) -> Self {
        self.tab_url = Some(tab_url.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Sets the tab URL only when it is absent. Returns whether it was set.
    pub fn ensure_tab_url(&mut self, tab_url: &str) -> bool {
        if self.tab_url.as_deref().is_some_and(|url| !url.is_empty()) {
            return false;
        }
        self.tab_url = Some(tab_url.to_owned());
        true
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn tab_url(&self) -> Option<&str> {
        self.tab_url.as_deref()
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

/// Millisecond-precision UTC timestamp, e.g. `2026-01-01T00:00:00.000Z`.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
