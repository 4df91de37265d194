use roost_internals::Message;
use tracing::trace;

use super::{deliver_copy, RoutingStrategy};
use crate::exchange::ExchangeInner;

/// Direct delivery: the single highest-priority matching binding takes the
/// message, then rotates to the back of the binding list, which round-robins
/// equal-top-priority matches across successive publishes.
pub struct DirectStrategy;

impl RoutingStrategy for DirectStrategy {
    fn deliver(&self, exchange: &ExchangeInner, message: &Message) -> u32 {
        let routing_key = message.routing_key();
        let delivered = match exchange.best_match(&routing_key) {
            None => {
                exchange.emit_return_if_mandatory(message);
                0
            }
            Some(selection) => {
                if selection.multiple {
                    exchange.rotate(&selection.queue_name, &selection.pattern);
                }
                trace!(%routing_key, queue_name = %selection.queue_name, "direct delivery");
                if deliver_copy(&selection.queue, exchange.name(), message) {
                    1
                } else {
                    0
                }
            }
        };
        // Resolved only after the hand-off: the round-robin path may hold
        // this message in flight across the dispatch boundary, which is why
        // direct exchanges persist their delivery queue.
        message.ack(false);
        delivered
    }
}
