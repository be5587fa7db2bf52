//! Pipes connecting producers, queues and consumers.
//!
//! Every pipe has at most one pull and one push in flight. Ordering comes from
//! awaiting each step in turn; there is no internal buffer of pending work.

mod consumer;
mod fan_in;
mod relay;
pub mod source;
mod stream;

pub use consumer::QueueToConsumerPipe;
pub use fan_in::FanInPipe;
pub use relay::QueueToQueuePipe;
pub use source::{
    dir_source, file_source, push_source, FileChunk, FileEntry, PushSource, SourceControl,
    SourceEvent, SourceHandle,
};
pub use stream::StreamToQueuePipe;
