use futures::future::select_all;
use tracing::debug;

use crate::core::flow::{wait_readable, Pusher};
use crate::core::queue::Queue;

/// Merges several queues into one writer.
///
/// Sources are polled in the order given: when more than one holds items, the
/// earliest wins. A source leaves the set once finished and drained; the
/// writer is finished when the last one leaves.
pub struct FanInPipe<T> {
    sources: Vec<Queue<T>>,
    sink: Box<dyn Pusher<T>>,
}

impl<T: Send + 'static> FanInPipe<T> {
    pub fn new(sources: Vec<Queue<T>>, sink: impl Pusher<T> + 'static) -> Self {
        Self {
            sources,
            sink: Box::new(sink),
        }
    }

    /// Returns how many items were forwarded.
    pub async fn start(self) -> usize {
        let Self { mut sources, sink } = self;
        let mut forwarded = 0;

        while !sources.is_empty() {
            if sources.iter().all(|queue| queue.empty()) {
                let _ = select_all(sources.iter().map(|queue| Box::pin(wait_readable(queue)))).await;
            }

            if let Some(source) = sources.iter().find(|queue| !queue.empty()) {
                if let Some(item) = source.pop().await {
                    sink.push(item).await;
                    forwarded += 1;
                }
            }

            sources.retain(|queue| {
                let done = queue.is_finished() && queue.empty();
                if done {
                    debug!(queue = %queue.name(), "fan-in source finished");
                }
                !done
            });
        }

        debug!(forwarded, "fan-in end");
        sink.finish();
        forwarded
    }
}
