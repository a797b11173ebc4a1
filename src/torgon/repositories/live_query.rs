use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::thread_repository::{MessagesCallback, ThreadsCallback};
use crate::torgon::models::{Message, Thread};

struct Listener<T> {
    callback: Box<dyn Fn(Vec<T>) + Send + Sync>,
    /// Highest revision delivered so far. Older snapshots are dropped.
    last_revision: Option<u64>,
}

type Slot<T> = Arc<Mutex<Listener<T>>>;

#[derive(Default)]
struct HubState {
    next_id: u64,
    message_listeners: HashMap<u64, (String, Slot<Message>)>,
    thread_listeners: HashMap<u64, Slot<Thread>>,
}

#[derive(Clone, Copy, Debug)]
enum Topic {
    Messages,
    Threads,
}

/// Fan-out of store snapshots to live-query subscribers.
///
/// Every write takes a revision from [`LiveQueryHub::next_revision`] after it
/// commits and then publishes a snapshot read after that point. A listener
/// never sees a snapshot older than the newest one it already received, so a
/// slow publisher cannot roll the view back.
#[derive(Clone, Default)]
pub struct LiveQueryHub {
    state: Arc<Mutex<HubState>>,
    revision: Arc<AtomicU64>,
}

impl LiveQueryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn watch_messages(&self, thread_id: &str, callback: MessagesCallback) -> Subscription {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.message_listeners.insert(
            id,
            (
                thread_id.to_string(),
                Arc::new(Mutex::new(Listener {
                    callback,
                    last_revision: None,
                })),
            ),
        );
        trace!(thread_id = %thread_id, subscription = id, "Message live query registered");
        self.subscription(id, Topic::Messages)
    }

    pub fn watch_threads(&self, callback: ThreadsCallback) -> Subscription {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.thread_listeners.insert(
            id,
            Arc::new(Mutex::new(Listener {
                callback,
                last_revision: None,
            })),
        );
        trace!(subscription = id, "Thread live query registered");
        self.subscription(id, Topic::Threads)
    }

    pub fn has_message_listeners(&self, thread_id: &str) -> bool {
        self.state
            .lock()
            .message_listeners
            .values()
            .any(|(tid, _)| tid == thread_id)
    }

    pub fn has_thread_listeners(&self) -> bool {
        !self.state.lock().thread_listeners.is_empty()
    }

    pub fn publish_messages(&self, thread_id: &str, revision: u64, messages: Vec<Message>) {
        let slots: Vec<Slot<Message>> = self
            .state
            .lock()
            .message_listeners
            .values()
            .filter(|(tid, _)| tid == thread_id)
            .map(|(_, slot)| slot.clone())
            .collect();
        fan_out(slots, revision, messages);
    }

    pub fn publish_threads(&self, revision: u64, threads: Vec<Thread>) {
        let slots: Vec<Slot<Thread>> = self.state.lock().thread_listeners.values().cloned().collect();
        fan_out(slots, revision, threads);
    }

    /// Initial snapshot for a single, freshly registered subscription.
    pub fn deliver_initial_messages(&self, subscription_id: u64, revision: u64, messages: Vec<Message>) {
        let slot = self
            .state
            .lock()
            .message_listeners
            .get(&subscription_id)
            .map(|(_, slot)| slot.clone());
        if let Some(slot) = slot {
            deliver(&slot, revision, messages);
        }
    }

    pub fn deliver_initial_threads(&self, subscription_id: u64, revision: u64, threads: Vec<Thread>) {
        let slot = self.state.lock().thread_listeners.get(&subscription_id).cloned();
        if let Some(slot) = slot {
            deliver(&slot, revision, threads);
        }
    }

    fn subscription(&self, id: u64, topic: Topic) -> Subscription {
        Subscription {
            hub: Arc::downgrade(&self.state),
            id,
            topic,
            active: true,
        }
    }
}

fn fan_out<T: Clone>(slots: Vec<Slot<T>>, revision: u64, mut items: Vec<T>) {
    let Some((last, rest)) = slots.split_last() else {
        return;
    };
    for slot in rest {
        deliver(slot, revision, items.clone());
    }
    deliver(last, revision, std::mem::take(&mut items));
}

fn deliver<T>(slot: &Slot<T>, revision: u64, items: Vec<T>) {
    let mut listener = slot.lock();
    if listener.last_revision.is_some_and(|seen| revision < seen) {
        trace!(revision, "Dropping stale live query snapshot");
        return;
    }
    listener.last_revision = Some(revision);
    (listener.callback)(items);
}

/// Handle to a live query. Dropping it (or calling [`Subscription::unsubscribe`])
/// stops delivery; [`Subscription::detach`] keeps it registered for as long as
/// the store lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<Mutex<HubState>>,
    id: u64,
    topic: Topic,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(state) = self.hub.upgrade() {
            let mut state = state.lock();
            match self.topic {
                Topic::Messages => {
                    state.message_listeners.remove(&self.id);
                }
                Topic::Threads => {
                    state.thread_listeners.remove(&self.id);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
