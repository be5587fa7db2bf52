//! Flow-control helpers.
//!
//! `suspend_until_available` and `suspend_until_room` are the only blocking
//! read and write primitives; every pipe and transport loop is built on them.
//! Both are cancel-safe: dropping the future forgets the listener it armed.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tokio::sync::Notify;

use crate::core::error::{ConfigError, PipeError};
use crate::core::queue::{Direction, Queue};

/// High/low watermark pair. `high > low` is enforced on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawWatermarks")]
pub struct Watermarks {
    high: usize,
    low: usize,
}

#[derive(Deserialize)]
struct RawWatermarks {
    high: usize,
    low: usize,
}

impl TryFrom<RawWatermarks> for Watermarks {
    type Error = ConfigError;

    fn try_from(raw: RawWatermarks) -> Result<Self, Self::Error> {
        Watermarks::new(raw.high, raw.low)
    }
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Result<Self, ConfigError> {
        if high <= low {
            return Err(ConfigError::InvalidWatermarks { high, low });
        }
        Ok(Self { high, low })
    }

    #[inline]
    pub fn high(&self) -> usize {
        self.high
    }

    #[inline]
    pub fn low(&self) -> usize {
        self.low
    }
}

/// Suspends until `queue` holds an item (`true`) or is finished and empty
/// (`false`). Does not pop.
pub async fn wait_readable<T: Send + 'static>(queue: &Queue<T>) -> bool {
    loop {
        if !queue.empty() {
            return true;
        }
        if queue.is_finished() {
            return false;
        }

        let arrived = Arc::new(Notify::new());
        let _guard = {
            let arrived = Arc::clone(&arrived);
            queue
                .add_level_listener_once(1, Direction::Rising, move || {
                    arrived.notify_one();
                    async {}
                })
                .guard()
        };

        // Re-check now that the listener is armed, so a push racing the
        // registration is not lost.
        if !queue.empty() {
            return true;
        }

        tokio::select! {
            _ = arrived.notified() => {}
            _ = queue.finished() => {}
        }
    }
}

/// Pops the head, suspending while the queue is empty.
///
/// Returns `None` once the queue is finished and drained.
pub async fn suspend_until_available<T: Send + 'static>(queue: &Queue<T>) -> Option<T> {
    loop {
        if let Some(data) = queue.pop().await {
            return Some(data);
        }
        if !wait_readable(queue).await {
            return None;
        }
    }
}

/// Pushes `data`, first suspending while the queue is above `marks.high`
/// until it has fallen back to `marks.low`.
pub async fn suspend_until_room<T: Send + 'static>(queue: &Queue<T>, data: T, marks: &Watermarks) {
    if queue.size() > marks.high {
        let room = Arc::new(Notify::new());
        let _guard = {
            let room = Arc::clone(&room);
            queue
                .add_level_listener_once(marks.low, Direction::Falling, move || {
                    room.notify_one();
                    async {}
                })
                .guard()
        };

        if queue.size() > marks.low {
            room.notified().await;
        }
    }

    queue.push(data).await;
}

/// Read end of a channel. `None` is the end-of-data sentinel.
pub trait Popper<T>: Send + Sync {
    fn pop(&self) -> BoxFuture<'_, Option<T>>;
}

/// Write end of a channel. `finish` is the end-of-data sentinel.
pub trait Pusher<T>: Send + Sync {
    fn push(&self, data: T) -> BoxFuture<'_, ()>;
    fn finish(&self);
}

/// Blocking reader over a queue.
#[derive(Debug, Clone)]
pub struct WaitPopper<T> {
    queue: Queue<T>,
}

impl<T: Send + 'static> Popper<T> for WaitPopper<T> {
    fn pop(&self) -> BoxFuture<'_, Option<T>> {
        suspend_until_available(&self.queue).boxed()
    }
}

/// Writer that respects the queue's watermarks.
#[derive(Debug, Clone)]
pub struct WaitPusher<T> {
    queue: Queue<T>,
    marks: Watermarks,
}

impl<T: Send + 'static> Pusher<T> for WaitPusher<T> {
    fn push(&self, data: T) -> BoxFuture<'_, ()> {
        suspend_until_room(&self.queue, data, &self.marks).boxed()
    }

    fn finish(&self) {
        self.queue.finish();
    }
}

/// Writer that never waits.
#[derive(Debug, Clone)]
pub struct DirectPusher<T> {
    queue: Queue<T>,
}

impl<T: Send + 'static> Pusher<T> for DirectPusher<T> {
    fn push(&self, data: T) -> BoxFuture<'_, ()> {
        async move {
            self.queue.push(data).await;
        }
        .boxed()
    }

    fn finish(&self) {
        self.queue.finish();
    }
}

pub fn wait_popper<T>(queue: &Queue<T>) -> WaitPopper<T> {
    WaitPopper {
        queue: queue.clone(),
    }
}

pub fn wait_pusher<T>(queue: &Queue<T>, marks: Watermarks) -> WaitPusher<T> {
    WaitPusher {
        queue: queue.clone(),
        marks,
    }
}

pub fn direct_pusher<T>(queue: &Queue<T>) -> DirectPusher<T> {
    DirectPusher {
        queue: queue.clone(),
    }
}

/// Moves every item from `popper` through `transform` into `pusher`, then
/// finishes `pusher`. Returns how many items went through.
pub async fn tunnel<S, D, P, W, F, Fut>(
    popper: &P,
    pusher: &W,
    mut transform: F,
) -> Result<usize, PipeError>
where
    P: Popper<S> + ?Sized,
    W: Pusher<D> + ?Sized,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = anyhow::Result<D>>,
{
    let mut moved = 0;
    while let Some(item) = popper.pop().await {
        let out = transform(item).await.map_err(PipeError::Transform)?;
        pusher.push(out).await;
        moved += 1;
    }
    pusher.finish();
    Ok(moved)
}
