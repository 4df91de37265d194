//! Queue and consumer layer of the roost broker engine: ordered message
//! storage, capacity management, priority dispatch and prefetch-bounded
//! flow control. Exchanges build on top of this crate; the name-keyed
//! registry facade lives outside the engine.

pub mod consumer;
pub mod queue;

pub use consumer::{Consumer, ConsumerOptions, OnMessage, Owner};
pub use queue::{DeleteOk, DeleteOptions, GetOptions, Queue, QueueOptions, QueueState};
