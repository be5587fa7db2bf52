pub mod error;
pub mod flow;
pub mod pipe;
pub mod queue;
pub mod registry;
