use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::core::error::PipeError;
use crate::core::flow::{suspend_until_available, Watermarks};
use crate::core::queue::{Direction, ListenerSubscription, Queue};

type Transform<S, D> = Box<dyn FnMut(S) -> BoxFuture<'static, anyhow::Result<D>> + Send>;

/// Relays items from one queue to the next, holding back while the
/// destination is paused between its high and low watermarks.
pub struct QueueToQueuePipe<S, D> {
    source: Queue<S>,
    destination: Queue<D>,
    paused: watch::Receiver<bool>,
    subscriptions: [ListenerSubscription; 2],
    transform: Transform<S, D>,
}

impl<T: Send + 'static> QueueToQueuePipe<T, T> {
    pub fn new(source: Queue<T>, destination: Queue<T>, marks: Watermarks) -> Self {
        Self::with_transform(source, destination, marks, |item| async move { Ok(item) })
    }
}

impl<S: Send + 'static, D: Send + 'static> QueueToQueuePipe<S, D> {
    pub fn with_transform<F, Fut>(
        source: Queue<S>,
        destination: Queue<D>,
        marks: Watermarks,
        mut transform: F,
    ) -> Self
    where
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
    {
        let (pause_tx, paused) = watch::channel(false);
        let pause_tx = Arc::new(pause_tx);
        let link = format!("{}->{}", source.name(), destination.name());

        let on_high = {
            let pause_tx = Arc::clone(&pause_tx);
            let link = link.clone();
            destination.add_level_listener(marks.high(), Direction::Rising, move || {
                debug!(pipe = %link, "pause inputs");
                pause_tx.send_replace(true);
                async {}
            })
        };

        let on_low = destination.add_level_listener(marks.low(), Direction::Falling, move || {
            let was_paused = pause_tx.send_if_modified(|paused| std::mem::replace(paused, false));
            if was_paused {
                debug!(pipe = %link, "resume inputs");
            }
            async {}
        });

        Self {
            source,
            destination,
            paused,
            subscriptions: [on_high, on_low],
            transform: Box::new(move |item| transform(item).boxed()),
        }
    }

    /// Runs until the source is finished and drained, then finishes the
    /// destination. Returns how many items were relayed.
    pub async fn start(mut self) -> Result<usize, PipeError> {
        let mut relayed = 0;
        let outcome = loop {
            let Some(item) = suspend_until_available(&self.source).await else {
                break Ok(relayed);
            };

            let out = match (self.transform)(item).await {
                Ok(out) => out,
                Err(err) => break Err(PipeError::Transform(err)),
            };

            if *self.paused.borrow() {
                trace!(source = %self.source.name(), "waiting for destination to drain");
            }
            // The sender is owned by our own listeners, alive until forgotten below.
            let _ = self.paused.wait_for(|paused| !*paused).await;

            self.destination.push(out).await;
            relayed += 1;
        };

        for subscription in &self.subscriptions {
            subscription.forget();
        }

        if outcome.is_ok() {
            debug!(
                source = %self.source.name(),
                destination = %self.destination.name(),
                relayed,
                "end of relay"
            );
            self.destination.finish();
        }
        outcome
    }
}
