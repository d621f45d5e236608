use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub const MAX_STORED_MESSAGES: usize = 200;
/// Partition key used when no tab URL can be resolved for a frame.
pub const UNKNOWN_TAB_URL: &str = "unknown";

/// Tab URL to messages, most recent first. This is both the wire shape of
/// `get_messages`/`messages_update` and the durable layout.
pub type StoreSnapshot = BTreeMap<String, Vec<StoredMessage>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(flatten)]
    pub frame: Frame,
    pub id: u64,
    pub is_new: bool,
}

/// Bounded per-tab message lists.
///
/// Each list is ordered most recent first and holds at most `capacity`
/// entries; appending past the bound drops the oldest entry. Ids are assigned
/// per list and grow by one from the current head.
#[derive(Debug, Clone)]
pub struct MessageStore {
    lists: BTreeMap<String, VecDeque<StoredMessage>>,
    capacity: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(MAX_STORED_MESSAGES)
    }
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            lists: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a store from persisted lists. Empty lists are dropped and
    /// oversized ones are cut down to the newest `capacity` entries.
    pub fn from_snapshot(snapshot: StoreSnapshot, capacity: usize) -> Self {
        let mut store = Self::new(capacity);
        for (tab_url, messages) in snapshot {
            let mut list: VecDeque<StoredMessage> = messages.into();
            list.truncate(store.capacity);
            if !list.is_empty() {
                store.lists.insert(tab_url, list);
            }
        }
        store
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&mut self, tab_url: &str, frame: Frame) -> &StoredMessage {
        let capacity = self.capacity;
        let list = self.lists.entry(tab_url.to_owned()).or_default();
        let id = list.front().map_or(1, |head| head.id.saturating_add(1));
        list.push_front(StoredMessage {
            frame,
            id,
            is_new: true,
        });
        list.truncate(capacity);
        &list[0]
    }

    pub fn messages(&self, tab_url: &str) -> Vec<StoredMessage> {
        self.lists
            .get(tab_url)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, tab_url: &str) -> bool {
        self.lists.contains_key(tab_url)
    }

    pub fn len(&self, tab_url: &str) -> usize {
        self.lists.get(tab_url).map_or(0, VecDeque::len)
    }

    pub fn tab_urls(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Removes the key entirely. Returns whether it existed.
    pub fn remove(&mut self, tab_url: &str) -> bool {
        self.lists.remove(tab_url).is_some()
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }

    /// Marks the given ids as acknowledged. Returns how many changed.
    pub fn mark_seen(&mut self, tab_url: &str, ids: &[u64]) -> usize {
        let Some(list) = self.lists.get_mut(tab_url) else {
            return 0;
        };
        let mut changed = 0;
        for message in list.iter_mut() {
            if message.is_new && ids.contains(&message.id) {
                message.is_new = false;
                changed += 1;
            }
        }
        changed
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lists
            .iter()
            .map(|(tab_url, list)| (tab_url.clone(), list.iter().cloned().collect()))
            .collect()
    }
}
