use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::error::PipeError;
use crate::core::flow::Watermarks;
use crate::core::pipe::source::{PushSource, SourceControl, SourceEvent};
use crate::core::queue::{Direction, ListenerSubscription, Queue};

/// Feeds a push-based source into a queue, pausing the source while the
/// queue sits above its high watermark.
pub struct StreamToQueuePipe<T> {
    events: mpsc::UnboundedReceiver<SourceEvent<T>>,
    queue: Queue<T>,
    subscriptions: [ListenerSubscription; 2],
}

impl<T: Send + 'static> StreamToQueuePipe<T> {
    pub fn new(source: PushSource<T>, queue: Queue<T>, marks: Watermarks) -> Self {
        let (events, control) = source.into_parts();

        let on_high = {
            let control: Arc<dyn SourceControl> = Arc::clone(&control);
            let name = queue.name().to_string();
            queue.add_level_listener(marks.high(), Direction::Rising, move || {
                debug!(queue = %name, "pause source");
                control.pause();
                async {}
            })
        };

        let on_low = {
            let name = queue.name().to_string();
            queue.add_level_listener(marks.low(), Direction::Falling, move || {
                debug!(queue = %name, "resume source");
                control.resume();
                async {}
            })
        };

        Self {
            events,
            queue,
            subscriptions: [on_high, on_low],
        }
    }

    /// Runs until the source ends (the queue is then finished) or fails.
    /// Returns how many items were queued.
    pub async fn start(mut self) -> Result<usize, PipeError> {
        let mut queued = 0;
        let outcome = loop {
            match self.events.recv().await {
                Some(SourceEvent::Data(data)) => {
                    self.queue.push(data).await;
                    queued += 1;
                }
                Some(SourceEvent::End) => break Ok(queued),
                None => {
                    debug!(queue = %self.queue.name(), "source dropped without end event");
                    break Ok(queued);
                }
                Some(SourceEvent::Error(err)) => break Err(PipeError::Source(err)),
            }
        };

        for subscription in &self.subscriptions {
            subscription.forget();
        }

        if outcome.is_ok() {
            debug!(queue = %self.queue.name(), queued, "source ended");
            self.queue.finish();
        }
        outcome
    }
}
