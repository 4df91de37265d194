//! Exchange layer of the roost broker engine: binding tables, routing-key
//! pattern matching and the per-type delivery strategies, with publishes
//! serialized through an internal queue so reentrant publishing stays in
//! strict FIFO order.

pub mod exchange;
pub mod strategies;

pub use exchange::{
    BindOptions, BindingState, BindingView, BrokerState, Exchange, ExchangeKind, ExchangeOptions,
    ExchangeState,
};
pub use strategies::Matcher;
