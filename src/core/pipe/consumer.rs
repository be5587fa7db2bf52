use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::core::error::PipeError;
use crate::core::flow::suspend_until_available;
use crate::core::queue::Queue;

type Consumer<T> = Box<dyn FnMut(T) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Drains a queue into an async consumer, one item at a time.
pub struct QueueToConsumerPipe<T> {
    queue: Queue<T>,
    consumer: Consumer<T>,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Send + 'static> QueueToConsumerPipe<T> {
    pub fn new<F, Fut, C>(queue: Queue<T>, mut consumer: F, on_finish: C) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self {
            queue,
            consumer: Box::new(move |item| consumer(item).boxed()),
            on_finish: Some(Box::new(on_finish)),
        }
    }

    /// Feeds every item to the consumer; the next pull starts only after the
    /// previous call settles. `on_finish` runs once the queue is finished and
    /// drained. A consumer error stops the pipe without calling it.
    pub async fn start(mut self) -> Result<usize, PipeError> {
        let mut consumed = 0;
        while let Some(item) = suspend_until_available(&self.queue).await {
            (self.consumer)(item).await.map_err(PipeError::Consumer)?;
            consumed += 1;
        }

        debug!(queue = %self.queue.name(), consumed, "consumer end");
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
        Ok(consumed)
    }
}
