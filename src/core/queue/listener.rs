//! Level-crossing listener bookkeeping.
//!
//! Listeners are stored per `(direction, level)` key in registration order and
//! identified by a generation id, so a subscription can be forgotten without
//! comparing closures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

/// Callback fired when a queue's length crosses a registered level.
pub type Listener = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Which size transitions a listener reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fires after a push lands exactly on the level.
    Rising,
    /// Fires after a pop lands exactly on the level.
    Falling,
    /// Fires after either operation lands exactly on the level.
    Either,
}

struct Entry {
    id: u64,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    next_id: u64,
    entries: HashMap<(Direction, usize), Vec<Entry>>,
}

impl ListenerTable {
    pub(crate) fn insert(
        &mut self,
        direction: Direction,
        level: usize,
        listener: Listener,
        once: bool,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries
            .entry((direction, level))
            .or_default()
            .push(Entry { id, once, listener });
        id
    }

    pub(crate) fn remove(&mut self, direction: Direction, level: usize, id: u64) -> bool {
        let key = (direction, level);
        let Some(list) = self.entries.get_mut(&key) else {
            return false;
        };

        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Listeners to run for a transition landing on `level`: the edge-specific
    /// ones first, then the `Either` ones. One-shot entries leave the table here.
    pub(crate) fn collect(&mut self, edge: Direction, level: usize) -> Vec<Listener> {
        let mut fired = Vec::new();
        for direction in [edge, Direction::Either] {
            let key = (direction, level);
            let Some(list) = self.entries.get_mut(&key) else {
                continue;
            };
            fired.extend(list.iter().map(|entry| Arc::clone(&entry.listener)));
            list.retain(|entry| !entry.once);
            if list.is_empty() {
                self.entries.remove(&key);
            }
        }
        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

pub(crate) fn listener<F, Fut>(callback: F) -> Listener
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || callback().boxed())
}

pub(crate) async fn fire(listeners: Vec<Listener>) {
    for listener in listeners {
        listener().await;
    }
}

/// Handle to one registered listener.
#[derive(Debug, Clone)]
pub struct ListenerSubscription {
    table: Weak<Mutex<ListenerTable>>,
    direction: Direction,
    level: usize,
    id: u64,
}

impl ListenerSubscription {
    pub(crate) fn new(
        table: &Arc<Mutex<ListenerTable>>,
        direction: Direction,
        level: usize,
        id: u64,
    ) -> Self {
        Self {
            table: Arc::downgrade(table),
            direction,
            level,
            id,
        }
    }

    /// Removes the listener. Calling it again, or after a one-shot listener
    /// already fired, does nothing.
    pub fn forget(&self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(self.direction, self.level, self.id);
        }
    }

    /// Ties the listener's lifetime to the returned guard.
    pub fn guard(self) -> ListenerGuard {
        ListenerGuard(self)
    }
}

/// Forgets its listener on drop, so an abandoned wait leaves nothing behind.
#[derive(Debug)]
pub struct ListenerGuard(ListenerSubscription);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.forget();
    }
}
