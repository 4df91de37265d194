use roost_internals::Message;
use tracing::trace;

use super::{deliver_copy, RoutingStrategy};
use crate::exchange::ExchangeInner;

/// Topic fan-out: a copy goes to every binding whose compiled pattern
/// matches the routing key, in binding priority order.
pub struct TopicStrategy;

impl RoutingStrategy for TopicStrategy {
    fn deliver(&self, exchange: &ExchangeInner, message: &Message) -> u32 {
        // Fan-out holds nothing back, so the delivery message is resolved
        // before the copies go out; the delivery queue never retains state
        // between synchronous publishes.
        message.ack(false);

        let routing_key = message.routing_key();
        let targets = exchange.matching_queues(&routing_key);
        if targets.is_empty() {
            exchange.emit_return_if_mandatory(message);
            return 0;
        }
        let mut delivered = 0;
        for queue in targets {
            if deliver_copy(&queue, exchange.name(), message) {
                delivered += 1;
            }
        }
        trace!(%routing_key, delivered, "topic fan-out completed");
        delivered
    }
}
