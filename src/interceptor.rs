//! Socket decorator that reports WebSocket traffic into the page channel.
//!
//! [`Interceptor`] takes the real [`SocketFactory`] as a dependency and is
//! itself a [`SocketFactory`], so code holding the factory cannot tell the
//! difference. Sockets whose URL does not contain the configured fragment are
//! handed back untouched.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    bridge::PageChannel,
    error::RelayError,
    frame::{Frame, Payload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    /// Numeric value as exposed by the WebSocket API (`CONNECTING` = 0 ... `CLOSED` = 3).
    pub fn code(self) -> u16 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    type Socket: Socket;

    async fn connect(&self, url: &str) -> anyhow::Result<Self::Socket>;
}

#[async_trait]
pub trait Socket: Send {
    fn url(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    async fn send(&mut self, payload: Payload) -> anyhow::Result<()>;

    /// Next inbound message; `None` once the socket is closed.
    async fn recv(&mut self) -> Option<anyhow::Result<Payload>>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Derives an application-level correlation id from a payload.
pub trait CorrelationExtractor: Send + Sync {
    fn extract(&self, payload: &str) -> Result<Option<String>, RelayError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCorrelation;

impl CorrelationExtractor for NoCorrelation {
    fn extract(&self, _payload: &str) -> Result<Option<String>, RelayError> {
        Ok(None)
    }
}

pub struct Interceptor<F> {
    inner: F,
    page: PageChannel,
    listen_url_fragment: Option<String>,
    tab_url: Option<String>,
    correlation: Arc<dyn CorrelationExtractor>,
}

impl<F> Interceptor<F> {
    pub fn new(inner: F, page: PageChannel) -> Self {
        Self {
            inner,
            page,
            listen_url_fragment: None,
            tab_url: None,
            correlation: Arc::new(NoCorrelation),
        }
    }

    /// Only sockets whose URL contains `fragment` are tapped. An empty
    /// fragment taps everything.
    pub fn with_listen_url_fragment(mut self, fragment: Option<String>) -> Self {
        self.listen_url_fragment = fragment.filter(|fragment| !fragment.is_empty());
        self
    }

    /// URL of the document the sockets belong to, stamped on every frame.
    pub fn with_tab_url(mut self, tab_url: Option<String>) -> Self {
        self.tab_url = tab_url;
        self
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationExtractor>) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn matches(&self, url: &str) -> bool {
        self.listen_url_fragment
            .as_deref()
            .is_none_or(|fragment| url.contains(fragment))
    }
}

#[async_trait]
impl<F: SocketFactory> SocketFactory for Interceptor<F> {
    type Socket = InterceptedSocket<F::Socket>;

    async fn connect(&self, url: &str) -> anyhow::Result<Self::Socket> {
        let inner = self.inner.connect(url).await?;
        if !self.matches(url) {
            return Ok(InterceptedSocket { inner, tap: None });
        }

        let tap = Tap {
            page: self.page.clone(),
            socket_url: url.to_owned(),
            tab_url: self.tab_url.clone(),
            correlation: Arc::clone(&self.correlation),
            close_reported: false,
        };
        tap.emit(Frame::connection_opened(url));
        Ok(InterceptedSocket {
            inner,
            tap: Some(tap),
        })
    }
}

struct Tap {
    page: PageChannel,
    socket_url: String,
    tab_url: Option<String>,
    correlation: Arc<dyn CorrelationExtractor>,
    close_reported: bool,
}

impl Tap {
    fn emit(&self, frame: Frame) {
        let frame = match &self.tab_url {
            Some(tab_url) => frame.with_tab_url(tab_url.clone()),
            None => frame,
        };
        if let Err(err) = self.page.post_frame(&frame) {
            tracing::debug!(socket_url = %self.socket_url, error = %err, "frame not posted");
        }
    }

    fn emit_with_correlation(&self, frame: Frame) {
        let frame = match self.correlation.extract(frame.payload()) {
            Ok(correlation_id) => frame.with_correlation_id(correlation_id),
            Err(err) => {
                tracing::debug!(
                    socket_url = %self.socket_url,
                    error = %err,
                    "correlation id skipped"
                );
                frame
            }
        };
        self.emit(frame);
    }

    fn emit_closed_once(&mut self) {
        if !self.close_reported {
            self.close_reported = true;
            self.emit(Frame::connection_closed(self.socket_url.clone()));
        }
    }
}

/// A socket as handed out by [`Interceptor`]: either tapped or a plain
/// pass-through.
pub struct InterceptedSocket<S> {
    inner: S,
    tap: Option<Tap>,
}

impl<S> InterceptedSocket<S> {
    pub fn is_tapped(&self) -> bool {
        self.tap.is_some()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Socket> Socket for InterceptedSocket<S> {
    fn url(&self) -> &str {
        self.inner.url()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.ready_state()
    }

    /// Reports the frame before the underlying socket transmits it.
    async fn send(&mut self, payload: Payload) -> anyhow::Result<()> {
        if let Some(tap) = &self.tap {
            tap.emit_with_correlation(Frame::sent(tap.socket_url.clone(), &payload));
        }
        self.inner.send(payload).await
    }

    /// Reports the frame before handing it to the caller.
    async fn recv(&mut self) -> Option<anyhow::Result<Payload>> {
        let next = self.inner.recv().await;
        if let Some(tap) = self.tap.as_mut() {
            match &next {
                Some(Ok(payload)) => {
                    tap.emit_with_correlation(Frame::received(tap.socket_url.clone(), payload));
                }
                Some(Err(_)) => {}
                None => tap.emit_closed_once(),
            }
        }
        next
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let result = self.inner.close().await;
        if let Some(tap) = self.tap.as_mut() {
            tap.emit_closed_once();
        }
        result
    }
}
