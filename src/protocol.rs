//! Message vocabulary shared by bridges, observers and the coordinator.
//!
//! Every request is tagged by its `action` field and carries its own typed
//! fields; field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::{frame::Frame, store::StoreSnapshot};

/// Tag carried by commands the bridge posts into the page.
pub const BRIDGE_SOURCE: &str = "wsinspect-bridge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    StoreMessage {
        ws_message: Frame,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_url: Option<String>,
    },
    GetMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_url: Option<String>,
    },
    ClearMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_url: Option<String>,
    },
    MarkSeen {
        tab_url: String,
        message_ids: Vec<u64>,
    },
    SearchUrl {
        search_url: String,
        tab_url: String,
    },
    ToggleStatusUi {
        show: bool,
    },
    SidebarReady,
    ToggleSidebar {
        /// Tab the request came from, when the sender is a tab.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_url: Option<String>,
    },
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Self::StoreMessage { .. } => "store_message",
            Self::GetMessages { .. } => "get_messages",
            Self::ClearMessages { .. } => "clear_messages",
            Self::MarkSeen { .. } => "mark_seen",
            Self::SearchUrl { .. } => "search_url",
            Self::ToggleStatusUi { .. } => "toggle_status_ui",
            Self::SidebarReady => "sidebar_ready",
            Self::ToggleSidebar { .. } => "toggle_sidebar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub active_tab_url: String,
    pub messages: StoreSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Messages(MessagesResponse),
    Ack { success: bool },
}

impl Response {
    pub fn ok() -> Self {
        Self::Ack { success: true }
    }

    pub fn failed() -> Self {
        Self::Ack { success: false }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Ack { success } => *success,
            Self::Messages(_) => true,
        }
    }
}

/// Events the coordinator pushes to the observer without being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum PushEvent {
    MessagesUpdate {
        messages: StoreSnapshot,
        active_tab_url: String,
    },
    SearchUrl {
        search_url: String,
        tab_url: String,
    },
}

/// Commands the coordinator delivers to a specific tab's bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TabCommand {
    ToggleSidebar,
    ToggleStatusUi { show: bool },
}

/// Commands the bridge posts into the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCommand {
    pub source: String,
    #[serde(flatten)]
    pub command: TabCommand,
}

impl PageCommand {
    pub fn new(command: TabCommand) -> Self {
        Self {
            source: BRIDGE_SOURCE.to_owned(),
            command,
        }
    }
}
