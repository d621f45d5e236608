use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{error::RelayError, protocol::PushEvent};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Coordinator-side end of an observer's long-lived connection.
#[derive(Debug, Clone)]
pub struct ObserverChannel {
    id: u64,
    tx: mpsc::Sender<PushEvent>,
}

impl ObserverChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Never waits. A closed or full queue is reported as a delivery failure.
    pub fn post(&self, event: PushEvent) -> Result<(), RelayError> {
        self.tx.try_send(event).map_err(|err| match err {
            TrySendError::Closed(_) => {
                RelayError::delivery(format!("observer {} channel closed", self.id))
            }
            TrySendError::Full(_) => {
                RelayError::delivery(format!("observer {} channel full", self.id))
            }
        })
    }
}

/// Holds zero or one observer channel.
#[derive(Debug, Default)]
pub struct ObserverSlot {
    channel: Option<ObserverChannel>,
}

impl ObserverSlot {
    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }

    pub fn bound_id(&self) -> Option<u64> {
        self.channel.as_ref().map(ObserverChannel::id)
    }

    /// Binds `channel`, returning whatever it displaced.
    pub fn bind(&mut self, channel: ObserverChannel) -> Option<ObserverChannel> {
        self.channel.replace(channel)
    }

    /// Clears the slot only if it still holds observer `id`.
    pub fn unbind(&mut self, id: u64) -> bool {
        if self.bound_id() == Some(id) {
            self.channel = None;
            return true;
        }
        false
    }

    /// Posts to the bound channel. On failure the channel is treated as stale
    /// and dropped. Returns `Ok(false)` when nothing is bound.
    pub fn deliver(&mut self, event: PushEvent) -> Result<bool, RelayError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(false);
        };
        match channel.post(event) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.channel = None;
                Err(err)
            }
        }
    }
}
