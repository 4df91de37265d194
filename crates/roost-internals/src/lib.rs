//! Shared leaf types of the roost broker engine: the message envelope and
//! its pending/consumed lifecycle, the closed event vocabulary, the error
//! taxonomy and the persisted message shape.

pub mod errors;
pub mod events;
pub mod message;
pub mod state;

pub use errors::RoostError;
pub use events::{ConsumerEvent, EventHub, ExchangeEvent, HandlerId, QueueEvent};
pub use message::{
    now_millis, Content, Message, MessageFields, MessageProperties, OnConsumed, Operation,
};
pub use state::MessageState;

pub type QueueName = String;
pub type ExchangeName = String;
pub type ConsumerTag = String;
