//! Backflow – backpressure-propagating queue pipelines and a request/reply
//! multiplexing transport, on tokio.
//!
//! This crate exports
//!  * `core`      – queues, flow-control helpers, pipes, queue registry
//!  * `transport` – request/reply correlation over one duplex connection
//!  * `rpc`       – the request set, server dispatch, a typed client and
//!                  resumable tree push
//!  * `config`    – TOML-driven runtime configuration
//!
//! A typical pipeline: a `StreamToQueuePipe` fills a queue from a file or
//! other push source, `QueueToQueuePipe`s relay items stage by stage while
//! pausing upstream at each high watermark, and the last queue feeds either a
//! `QueueToConsumerPipe` or the transport's outgoing request channel.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod rpc;
pub mod transport;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use crate::core::flow::{suspend_until_available, suspend_until_room, Watermarks};
pub use crate::core::queue::{Direction, ListenerSubscription, Queue};
pub use crate::core::registry::QueueRegistry;
pub use transport::{Transport, TransportChannels, TransportHandle};
