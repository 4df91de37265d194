//! Closed event vocabulary plus the synchronous observer hub that replaces
//! a string-routed event bus: components emit tagged variants, observers
//! match on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::{Message, Operation};
use crate::{ConsumerTag, ExchangeName, QueueName};

/// Token returned by [`EventHub::on`], used to unregister the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous observer registry. Emission walks a snapshot of the handler
/// list, so handlers may register or unregister reentrantly while an event
/// is being dispatched.
pub struct EventHub<E> {
    handlers: Mutex<Vec<(HandlerId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        EventHub {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        EventHub::new()
    }
}

#[derive(Clone, Debug)]
pub enum QueueEvent {
    /// A message was appended to the queue.
    Message(Message),
    /// The insert filled the queue to capacity.
    Saturated,
    /// The queue ran empty.
    Depleted,
    /// A resolution freed capacity; exactly one slot is open again.
    Ready { capacity: usize },
    /// A consumer was registered.
    Consume { consumer_tag: ConsumerTag },
    /// A consumer was cancelled or dismissed.
    ConsumerCancel { consumer_tag: ConsumerTag },
    /// A non-requeued nack or reject on a queue with a dead-letter target.
    /// The message is a stripped copy: expiration cleared, routing key
    /// possibly overridden.
    DeadLetter {
        source_queue: QueueName,
        dead_letter_exchange: ExchangeName,
        message: Message,
    },
    /// A message with the confirm property was resolved without requeue.
    MessageConsumed { operation: Operation, message: Message },
    /// The queue was deleted.
    Delete,
    /// The queue was closed.
    Close,
}

#[derive(Clone, Debug)]
pub enum ExchangeEvent {
    Bind {
        queue_name: QueueName,
        pattern: String,
    },
    Unbind {
        queue_name: QueueName,
        pattern: String,
    },
    /// A mandatory publish matched no binding; the full message comes back.
    Return(Message),
    /// The last binding of an auto-delete exchange was removed.
    Delete,
    Close,
}

#[derive(Clone, Debug)]
pub enum ConsumerEvent {
    Cancel { consumer_tag: ConsumerTag },
}
