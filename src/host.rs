use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::RelayError, protocol::TabCommand};

/// The runtime surrounding the coordinator: tab introspection and per-tab
/// command delivery.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// URL of the currently focused tab, if any.
    async fn focused_tab_url(&self) -> Result<Option<String>, RelayError>;

    async fn send_to_tab(&self, tab_url: &str, command: TabCommand) -> Result<(), RelayError>;
}

#[derive(Debug, Default)]
struct Tabs {
    bridges: HashMap<String, mpsc::UnboundedSender<TabCommand>>,
    focused: Option<String>,
}

/// In-process tab registry. Each registered tab hands back the receiving end
/// its bridge listens on.
#[derive(Debug, Default)]
pub struct LocalHost {
    tabs: Mutex<Tabs>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a tab. A previous registration for the
    /// same URL is dropped.
    pub fn register_tab(&self, tab_url: &str) -> mpsc::UnboundedReceiver<TabCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_tabs().bridges.insert(tab_url.to_owned(), tx);
        rx
    }

    pub fn unregister_tab(&self, tab_url: &str) {
        let mut tabs = self.lock_tabs();
        tabs.bridges.remove(tab_url);
        if tabs.focused.as_deref() == Some(tab_url) {
            tabs.focused = None;
        }
    }

    pub fn focus(&self, tab_url: Option<&str>) {
        self.lock_tabs().focused = tab_url.map(str::to_owned);
    }

    fn lock_tabs(&self) -> MutexGuard<'_, Tabs> {
        self.tabs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HostPlatform for LocalHost {
    async fn focused_tab_url(&self) -> Result<Option<String>, RelayError> {
        Ok(self.lock_tabs().focused.clone())
    }

    async fn send_to_tab(&self, tab_url: &str, command: TabCommand) -> Result<(), RelayError> {
        let tabs = self.lock_tabs();
        let Some(bridge) = tabs.bridges.get(tab_url) else {
            return Err(RelayError::delivery(format!(
                "no bridge loaded for tab `{tab_url}`"
            )));
        };
        bridge
            .send(command)
            .map_err(|_| RelayError::delivery(format!("bridge for tab `{tab_url}` is gone")))
    }
}

#[cfg(test)]
mod tests {
    use super::{HostPlatform, LocalHost};
    use crate::{error::RelayError, protocol::TabCommand};

    #[tokio::test]
    async fn delivers_commands_to_registered_tab() {
        let host = LocalHost::new();
        let mut rx = host.register_tab("https://a.test");

        host.send_to_tab("https://a.test", TabCommand::ToggleSidebar)
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), TabCommand::ToggleSidebar);
    }

    #[tokio::test]
    async fn missing_or_dropped_bridge_is_a_delivery_failure() {
        let host = LocalHost::new();
        let err = host
            .send_to_tab("https://a.test", TabCommand::ToggleSidebar)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery(_)));

        let rx = host.register_tab("https://a.test");
        drop(rx);
        let err = host
            .send_to_tab("https://a.test", TabCommand::ToggleStatusUi { show: true })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery(_)));
    }

    #[tokio::test]
    async fn unregistering_focused_tab_clears_focus() {
        let host = LocalHost::new();
        let _rx = host.register_tab("https://a.test");
        host.focus(Some("https://a.test"));
        assert_eq!(
            host.focused_tab_url().await.unwrap().as_deref(),
            Some("https://a.test")
        );

        host.unregister_tab("https://a.test");
        assert_eq!(host.focused_tab_url().await.unwrap(), None);
    }
}
