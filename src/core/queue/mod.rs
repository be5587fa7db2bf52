//! Backflow queue module.
//!
//! A `Queue` is an unbounded FIFO instrumented with level-crossing listeners.
//! Bounding is left to callers: the flow-control helpers in `core::flow` turn
//! the listeners into pause/resume signals around a high/low watermark pair.
//!
//! Listener callbacks are awaited, in order, before the `push`/`pop` that
//! triggered them resolves. No lock is held while they run, so a callback may
//! freely push to or pop from any queue, including this one.

mod listener;

pub use listener::{Direction, Listener, ListenerGuard, ListenerSubscription};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::core::registry::QueueProbe;
use listener::{fire, listener, ListenerTable};

/// One payload held by the queue between push and pop.
#[derive(Debug)]
struct QueueItem<T> {
    data: T,
}

struct Inner<T> {
    name: String,
    items: Mutex<VecDeque<QueueItem<T>>>,
    listeners: Arc<Mutex<ListenerTable>>,
    finished: Arc<watch::Sender<bool>>,
    finishing: AtomicBool,
}

/// Shared handle to a named FIFO queue. Clones refer to the same queue.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("size", &self.inner.items.lock().len())
            .field("finished", &*self.inner.finished.borrow())
            .finish()
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Creates an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                items: Mutex::new(VecDeque::new()),
                listeners: Arc::new(Mutex::new(ListenerTable::default())),
                finished: Arc::new(finished),
                finishing: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.inner.items.lock().len()
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Appends `data` at the tail, then runs the rising and level listeners
    /// registered at the new length. Never rejects.
    pub async fn push(&self, data: T) -> bool {
        let fired = {
            let mut items = self.inner.items.lock();
            items.push_back(QueueItem { data });
            let len = items.len();
            trace!(queue = %self.inner.name, size = len, "push");
            self.inner.listeners.lock().collect(Direction::Rising, len)
        };

        fire(fired).await;
        true
    }

    /// Removes the head, then runs the falling and level listeners registered
    /// at the new length. Returns `None`, firing nothing, when empty.
    pub async fn pop(&self) -> Option<T> {
        let (data, fired) = {
            let mut items = self.inner.items.lock();
            let item = items.pop_front()?;
            let len = items.len();
            trace!(queue = %self.inner.name, size = len, "pop");
            (item.data, self.inner.listeners.lock().collect(Direction::Falling, len))
        };

        fire(fired).await;
        Some(data)
    }

    /// Removes the first item matching `predicate` wherever it sits, with the
    /// same notifications as `pop`. `None` means nothing matched.
    pub async fn pop_filter<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let (data, fired) = {
            let mut items = self.inner.items.lock();
            let position = items.iter().position(|item| predicate(&item.data))?;
            let item = items.remove(position)?;
            let len = items.len();
            trace!(queue = %self.inner.name, size = len, position, "pop_filter");
            (item.data, self.inner.listeners.lock().collect(Direction::Falling, len))
        };

        fire(fired).await;
        Some(data)
    }

    /// Declares that nothing more will be pushed.
    ///
    /// An empty queue is finished immediately; otherwise the flag is set by
    /// the pop that brings the length back to zero.
    pub fn finish(&self) {
        let items = self.inner.items.lock();
        if items.is_empty() {
            self.inner.finished.send_replace(true);
            debug!(queue = %self.inner.name, "finished");
            return;
        }

        if self.inner.finishing.swap(true, Ordering::AcqRel) {
            return;
        }

        let flag = Arc::clone(&self.inner.finished);
        let name = self.inner.name.clone();
        self.inner.listeners.lock().insert(
            Direction::Falling,
            0,
            listener(move || {
                flag.send_replace(true);
                debug!(queue = %name, "finished after drain");
                async {}
            }),
            true,
        );
        debug!(queue = %self.inner.name, pending = items.len(), "finish deferred until drained");
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        *self.inner.finished.borrow()
    }

    /// Resolves once the queue is finished.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|finished| *finished).await;
    }

    /// Registers `callback` to run whenever the length lands on `level`
    /// in the given direction.
    pub fn add_level_listener<F, Fut>(
        &self,
        level: usize,
        direction: Direction,
        callback: F,
    ) -> ListenerSubscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(level, direction, listener(callback), false)
    }

    /// Like `add_level_listener`, but the listener is removed the first time
    /// it fires.
    pub fn add_level_listener_once<F, Fut>(
        &self,
        level: usize,
        direction: Direction,
        callback: F,
    ) -> ListenerSubscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(level, direction, listener(callback), true)
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Weak introspection handle for a `QueueRegistry`.
    pub fn probe(&self) -> Weak<dyn QueueProbe> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        weak
    }

    fn register(
        &self,
        level: usize,
        direction: Direction,
        callback: Listener,
        once: bool,
    ) -> ListenerSubscription {
        let id = self
            .inner
            .listeners
            .lock()
            .insert(direction, level, callback, once);
        ListenerSubscription::new(&self.inner.listeners, direction, level, id)
    }
}

impl<T: Send + 'static> QueueProbe for Inner<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.items.lock().len()
    }

    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}
