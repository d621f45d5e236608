//! Per-tab relay between the page and the coordinator.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    coordinator::CoordinatorHandle,
    error::RelayError,
    frame::{Frame, INTERCEPTOR_SOURCE},
    protocol::{MessagesResponse, PageCommand, Request, Response, TabCommand},
};

/// The page's own message bus. Anything on the page may post to it, so
/// receivers must check the `source` tag.
#[derive(Debug, Clone)]
pub struct PageChannel {
    tx: mpsc::UnboundedSender<Value>,
}

impl PageChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, message: Value) -> Result<(), RelayError> {
        self.tx
            .send(message)
            .map_err(|_| RelayError::delivery("page channel closed"))
    }

    pub fn post_frame(&self, frame: &Frame) -> Result<(), RelayError> {
        let message = serde_json::to_value(frame)
            .map_err(|err| RelayError::malformed_frame(format!("serialize frame: {err}")))?;
        self.post(message)
    }
}

pub struct ContextBridge {
    document_url: String,
    coordinator: CoordinatorHandle,
    page: mpsc::UnboundedSender<PageCommand>,
}

impl ContextBridge {
    /// Returns the bridge and the receiving end of the commands it posts into
    /// the page.
    pub fn new(
        document_url: impl Into<String>,
        coordinator: CoordinatorHandle,
    ) -> (Self, mpsc::UnboundedReceiver<PageCommand>) {
        let (page, page_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            document_url: document_url.into(),
            coordinator,
            page,
        };
        (bridge, page_rx)
    }

    pub fn document_url(&self) -> &str {
        &self.document_url
    }

    /// Forwards one page message to the coordinator if it came from the
    /// interceptor. Forwarding is fire-and-forget; failures are logged and
    /// dropped. Returns whether the message was forwarded.
    pub fn relay_page_message(&self, message: Value) -> bool {
        if message.get("source").and_then(Value::as_str) != Some(INTERCEPTOR_SOURCE) {
            return false;
        }

        let mut frame: Frame = match serde_json::from_value(message) {
            Ok(frame) => frame,
            Err(err) => {
                let err = RelayError::malformed_frame(err.to_string());
                tracing::warn!(tab_url = %self.document_url, error = %err, "dropping page message");
                return false;
            }
        };
        frame.ensure_tab_url(&self.document_url);
        let tab_url = frame
            .tab_url()
            .unwrap_or(self.document_url.as_str())
            .to_owned();

        tracing::debug!(
            tab_url = %tab_url,
            kind = frame.kind().as_str(),
            socket_url = frame.socket_url(),
            "relay frame"
        );
        if let Err(err) = self.coordinator.notify(Request::StoreMessage {
            ws_message: frame,
            tab_url: Some(tab_url.clone()),
        }) {
            tracing::warn!(tab_url = %tab_url, error = %err, "forward frame failed");
            return false;
        }
        true
    }

    /// Fetches the whole store. `tab_url` (default: this document) only tells
    /// the coordinator which tab the caller is looking at.
    pub async fn get_messages(&self, tab_url: Option<&str>) -> Result<MessagesResponse, RelayError> {
        let tab_url = tab_url.unwrap_or(&self.document_url).to_owned();
        match self
            .coordinator
            .request(Request::GetMessages {
                tab_url: Some(tab_url),
            })
            .await?
        {
            Some(Response::Messages(messages)) => Ok(messages),
            other => Err(RelayError::delivery(format!(
                "unexpected get_messages response: {other:?}"
            ))),
        }
    }

    /// Clears one tab, or the whole store when `tab_url` is `None`.
    pub async fn clear_messages(&self, tab_url: Option<&str>) -> Result<bool, RelayError> {
        let response = self
            .coordinator
            .request(Request::ClearMessages {
                tab_url: tab_url.map(str::to_owned),
            })
            .await?;
        Ok(response.is_some_and(|response| response.is_success()))
    }

    pub async fn search_url(&self, search_url: &str, tab_url: &str) -> Result<bool, RelayError> {
        let response = self
            .coordinator
            .request(Request::SearchUrl {
                search_url: search_url.to_owned(),
                tab_url: tab_url.to_owned(),
            })
            .await?;
        Ok(response.is_some_and(|response| response.is_success()))
    }

    pub fn toggle_status_ui(&self, show: bool) -> Result<(), RelayError> {
        self.post_to_page(TabCommand::ToggleStatusUi { show })
    }

    /// Applies a command the coordinator routed to this tab.
    pub fn apply_tab_command(&self, command: TabCommand) {
        if let Err(err) = self.post_to_page(command) {
            tracing::warn!(tab_url = %self.document_url, ?command, error = %err, "page command dropped");
        }
    }

    fn post_to_page(&self, command: TabCommand) -> Result<(), RelayError> {
        self.page
            .send(PageCommand::new(command))
            .map_err(|_| RelayError::delivery("page is gone"))
    }

    /// Relays page messages and tab commands until the page channel closes.
    /// Page messages are forwarded one at a time in arrival order.
    pub async fn run(
        self,
        mut page_rx: mpsc::UnboundedReceiver<Value>,
        mut tab_rx: mpsc::UnboundedReceiver<TabCommand>,
    ) {
        let mut tab_open = true;
        loop {
            tokio::select! {
                message = page_rx.recv() => match message {
                    Some(message) => {
                        self.relay_page_message(message);
                    }
                    None => break,
                },
                command = tab_rx.recv(), if tab_open => match command {
                    Some(command) => self.apply_tab_command(command),
                    None => tab_open = false,
                },
            }
        }
        tracing::debug!(tab_url = %self.document_url, "page channel closed; bridge stopped");
    }
}
