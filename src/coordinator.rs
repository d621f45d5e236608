//! The single owner of the message store.
//!
//! A [`Coordinator`] is plain owned state; [`Coordinator::start`] moves it onto
//! a task that drains one queue, so each request runs to completion before the
//! next one is looked at. Clones of [`CoordinatorHandle`] are how bridges and
//! observers talk to it.
//!
//! Every update is offered twice: to the bound observer channel, and to a
//! session-wide broadcast. An observer may therefore see the same update
//! twice. Both paths carry the same full snapshot, so applying it again is
//! harmless.
//!
//! A `clear` racing an `append` for the same tab resolves to whichever the
//! queue served last.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    error::RelayError,
    frame::Frame,
    host::HostPlatform,
    observer::{ObserverChannel, ObserverSlot},
    protocol::{MessagesResponse, PushEvent, Request, Response, TabCommand},
    storage::DurableStorage,
    store::{MAX_STORED_MESSAGES, MessageStore, UNKNOWN_TAB_URL},
};

const DEFAULT_OBSERVER_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_BROADCAST_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub max_messages: usize,
    pub observer_channel_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_messages: MAX_STORED_MESSAGES,
            observer_channel_capacity: DEFAULT_OBSERVER_CHANNEL_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    /// Fresh install: durable state is wiped.
    Install,
    /// Upgrade: durable state is kept.
    Update,
}

pub struct Coordinator {
    store: MessageStore,
    storage: Arc<dyn DurableStorage>,
    host: Arc<dyn HostPlatform>,
    observer: ObserverSlot,
    broadcast: broadcast::Sender<PushEvent>,
}

impl Coordinator {
    /// Builds a coordinator whose store is rehydrated from `storage`. A failed
    /// read is logged and the coordinator starts empty.
    pub async fn init(
        storage: Arc<dyn DurableStorage>,
        host: Arc<dyn HostPlatform>,
        options: CoordinatorOptions,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(options.broadcast_capacity.max(1));
        Self::init_with_broadcast(storage, host, options, broadcast).await
    }

    async fn init_with_broadcast(
        storage: Arc<dyn DurableStorage>,
        host: Arc<dyn HostPlatform>,
        options: CoordinatorOptions,
        broadcast: broadcast::Sender<PushEvent>,
    ) -> Self {
        let store = match storage.load_all().await {
            Ok(snapshot) => MessageStore::from_snapshot(snapshot, options.max_messages),
            Err(err) => {
                tracing::warn!(error = %err, "rehydrate message store failed; starting empty");
                MessageStore::new(options.max_messages)
            }
        };
        tracing::debug!(
            tabs = store.tab_urls().count(),
            "message store rehydrated"
        );

        Self {
            store,
            storage,
            host,
            observer: ObserverSlot::default(),
            broadcast,
        }
    }

    /// Spawns the coordinator task. Requests sent through the returned handle
    /// queue up until rehydration has finished.
    pub fn start(
        storage: Arc<dyn DurableStorage>,
        host: Arc<dyn HostPlatform>,
        options: CoordinatorOptions,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(options.broadcast_capacity.max(1));
        let handle = CoordinatorHandle {
            tx,
            broadcast: broadcast.clone(),
            observer_channel_capacity: options.observer_channel_capacity,
        };

        tokio::spawn(async move {
            let coordinator =
                Self::init_with_broadcast(storage, host, options, broadcast).await;
            coordinator.run(rx).await;
        });

        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Request { request, reply } => {
                    let action = request.action();
                    let response = self.handle(request).await;
                    if let Some(reply) = reply
                        && reply.send(response).is_err()
                    {
                        tracing::debug!(action, "requester went away before the response");
                    }
                }
                Envelope::Bind(channel) => self.bind(channel),
                Envelope::Unbind(id) => self.unbind(id),
                Envelope::Installed { reason, reply } => {
                    let committed = self.on_installed(reason).await;
                    if reply.send(committed).is_err() {
                        tracing::debug!(?reason, "lifecycle caller went away before the result");
                    }
                }
            }
        }
        tracing::debug!("coordinator queue closed");
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn observer_bound(&self) -> bool {
        self.observer.is_bound()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.broadcast.subscribe()
    }

    /// Dispatches one protocol request. `toggle_sidebar` has no response.
    pub async fn handle(&mut self, request: Request) -> Option<Response> {
        tracing::debug!(action = request.action(), "handle request");
        match request {
            Request::StoreMessage { ws_message, tab_url } => {
                self.append(tab_url.as_deref(), ws_message).await;
                Some(Response::ok())
            }
            Request::GetMessages { tab_url } => Some(Response::Messages(
                self.query(tab_url.as_deref()).await,
            )),
            Request::ClearMessages { tab_url } => {
                self.clear(tab_url.as_deref()).await;
                Some(Response::ok())
            }
            Request::MarkSeen {
                tab_url,
                message_ids,
            } => {
                self.mark_seen(&tab_url, &message_ids).await;
                Some(Response::ok())
            }
            Request::SearchUrl {
                search_url,
                tab_url,
            } => {
                self.push(PushEvent::SearchUrl {
                    search_url,
                    tab_url,
                });
                Some(Response::ok())
            }
            Request::ToggleStatusUi { show } => {
                let tab_url = self.resolve_active_tab(None).await;
                let delivered = self
                    .send_to_tab(&tab_url, TabCommand::ToggleStatusUi { show })
                    .await;
                Some(Response::Ack { success: delivered })
            }
            Request::SidebarReady => {
                self.push_update().await;
                Some(Response::ok())
            }
            Request::ToggleSidebar { tab_url } => {
                let tab_url = match tab_url.filter(|url| !url.is_empty()) {
                    Some(tab_url) => tab_url,
                    None => self.resolve_active_tab(None).await,
                };
                self.send_to_tab(&tab_url, TabCommand::ToggleSidebar).await;
                None
            }
        }
    }

    /// Stores `frame` under `tab_url` (falling back to the frame's own tab URL,
    /// then `"unknown"`), mirrors the tab's list to durable storage, and on
    /// success pushes an update. Returns whether the write was persisted; the
    /// in-memory append stands either way.
    pub async fn append(&mut self, tab_url: Option<&str>, frame: Frame) -> bool {
        let key = tab_url
            .filter(|url| !url.is_empty())
            .or_else(|| frame.tab_url().filter(|url| !url.is_empty()))
            .unwrap_or(UNKNOWN_TAB_URL)
            .to_owned();

        let stored = self.store.append(&key, frame);
        tracing::debug!(
            tab_url = %key,
            id = stored.id,
            kind = stored.frame.kind().as_str(),
            socket_url = stored.frame.socket_url(),
            "message stored"
        );

        if let Err(err) = self.storage.put(&key, self.store.messages(&key)).await {
            tracing::warn!(tab_url = %key, error = %err, "persist tab messages failed");
            return false;
        }

        self.push_update().await;
        true
    }

    /// Clears one tab, or everything when `tab_url` is `None`. Clearing a tab
    /// that has no messages is fine. An update is pushed regardless of the
    /// storage outcome. Returns whether durable storage was updated.
    pub async fn clear(&mut self, tab_url: Option<&str>) -> bool {
        let persisted = match tab_url {
            Some(tab_url) => {
                self.store.remove(tab_url);
                self.storage.remove(tab_url).await
            }
            None => {
                self.store.clear();
                self.storage.clear().await
            }
        };

        let committed = match persisted {
            Ok(()) => {
                tracing::info!(tab_url = tab_url.unwrap_or("*"), "messages cleared");
                true
            }
            Err(err) => {
                tracing::warn!(
                    tab_url = tab_url.unwrap_or("*"),
                    error = %err,
                    "clear durable messages failed"
                );
                false
            }
        };

        self.push_update().await;
        committed
    }

    /// Snapshot of the whole store plus the tab the caller is looking at.
    pub async fn query(&self, tab_url_hint: Option<&str>) -> MessagesResponse {
        MessagesResponse {
            active_tab_url: self.resolve_active_tab(tab_url_hint).await,
            messages: self.store.snapshot(),
        }
    }

    pub async fn mark_seen(&mut self, tab_url: &str, ids: &[u64]) -> bool {
        if self.store.mark_seen(tab_url, ids) == 0 {
            return true;
        }
        match self.storage.put(tab_url, self.store.messages(tab_url)).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(tab_url, error = %err, "persist acknowledged messages failed");
                false
            }
        }
    }

    /// Binds the observer channel, silently replacing any previous one.
    pub fn bind(&mut self, channel: ObserverChannel) {
        let id = channel.id();
        if let Some(previous) = self.observer.bind(channel) {
            tracing::debug!(
                observer = id,
                replaced = previous.id(),
                "observer channel replaced"
            );
        } else {
            tracing::debug!(observer = id, "observer channel bound");
        }
    }

    pub fn unbind(&mut self, id: u64) {
        if self.observer.unbind(id) {
            tracing::debug!(observer = id, "observer channel unbound");
        }
    }

    /// Returns whether durable storage reflects the lifecycle change.
    pub async fn on_installed(&mut self, reason: InstallReason) -> bool {
        match reason {
            InstallReason::Install => {
                self.store.clear();
                match self.storage.clear().await {
                    Ok(()) => {
                        tracing::info!("fresh install; stored messages wiped");
                        true
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "wipe storage on install failed");
                        false
                    }
                }
            }
            InstallReason::Update => {
                tracing::info!(
                    tabs = self.store.tab_urls().count(),
                    "updated; stored messages kept"
                );
                true
            }
        }
    }

    async fn push_update(&mut self) {
        let event = PushEvent::MessagesUpdate {
            messages: self.store.snapshot(),
            active_tab_url: self.resolve_active_tab(None).await,
        };
        self.push(event);
    }

    fn push(&mut self, event: PushEvent) {
        if let Err(err) = self.observer.deliver(event.clone()) {
            tracing::warn!(error = %err, "observer channel stale; unbound");
        }

        if let Err(err) = self.broadcast.send(event) {
            tracing::debug!("no broadcast receivers for update: {err}");
        }
    }

    /// Focused tab, then `hint`, then the empty string.
    async fn resolve_active_tab(&self, hint: Option<&str>) -> String {
        let fallback = || hint.unwrap_or_default().to_owned();
        match self.host.focused_tab_url().await {
            Ok(Some(url)) if !url.is_empty() => url,
            Ok(_) => fallback(),
            Err(err) => {
                let err = match err {
                    RelayError::NoActiveTab(_) => err,
                    other => RelayError::no_active_tab(other.to_string()),
                };
                tracing::debug!(error = %err, "falling back to caller tab hint");
                fallback()
            }
        }
    }

    async fn send_to_tab(&self, tab_url: &str, command: TabCommand) -> bool {
        match self.host.send_to_tab(tab_url, command).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(tab_url, ?command, error = %err, "tab command not delivered");
                false
            }
        }
    }
}

enum Envelope {
    Request {
        request: Request,
        reply: Option<oneshot::Sender<Option<Response>>>,
    },
    Bind(ObserverChannel),
    Unbind(u64),
    Installed {
        reason: InstallReason,
        reply: oneshot::Sender<bool>,
    },
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    broadcast: broadcast::Sender<PushEvent>,
    observer_channel_capacity: usize,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CoordinatorHandle {
    /// Enqueues `request` without waiting for an answer. Requests enqueued
    /// from one caller are served in the order they were enqueued.
    pub fn notify(&self, request: Request) -> Result<(), RelayError> {
        self.enqueue(Envelope::Request {
            request,
            reply: None,
        })
    }

    pub async fn request(&self, request: Request) -> Result<Option<Response>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Envelope::Request {
            request,
            reply: Some(reply),
        })?;
        rx.await
            .map_err(|_| RelayError::delivery("coordinator dropped the request"))
    }

    /// Opens the observer channel, replacing whichever observer held it.
    pub fn connect_observer(&self) -> Result<ObserverConnection, RelayError> {
        let (channel, events) = ObserverChannel::new(self.observer_channel_capacity);
        let id = channel.id();
        self.enqueue(Envelope::Bind(channel))?;
        Ok(ObserverConnection {
            id,
            events,
            handle: self.clone(),
        })
    }

    pub async fn installed(&self, reason: InstallReason) -> Result<bool, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Envelope::Installed { reason, reply })?;
        rx.await
            .map_err(|_| RelayError::delivery("coordinator dropped the lifecycle hook"))
    }

    /// Subscribes to the broadcast fallback path.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.broadcast.subscribe()
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), RelayError> {
        self.tx
            .send(envelope)
            .map_err(|_| RelayError::delivery("coordinator is not running"))
    }
}

/// Observer-side end of the long-lived channel.
#[derive(Debug)]
pub struct ObserverConnection {
    id: u64,
    events: mpsc::Receiver<PushEvent>,
    handle: CoordinatorHandle,
}

impl ObserverConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.events.try_recv().ok()
    }

    pub async fn request(&self, request: Request) -> Result<Option<Response>, RelayError> {
        self.handle.request(request).await
    }

    pub fn disconnect(self) {
        if let Err(err) = self.handle.enqueue(Envelope::Unbind(self.id)) {
            tracing::debug!(observer = self.id, error = %err, "disconnect after coordinator stopped");
        }
    }
}
