use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use roost_internals::message::now_millis;
use roost_internals::{
    Content, EventHub, HandlerId, Message, MessageFields, MessageProperties, MessageState,
    OnConsumed, Operation, QueueEvent, QueueName, RoostError,
};

use crate::consumer::{Consumer, ConsumerOptions, OnMessage, Owner};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Hard cap on stored messages. `None` is unbounded; `Some(0)` discards
    /// every insert immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Default TTL in milliseconds applied to messages without their own
    /// expiration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_routing_key: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            auto_delete: true,
            exclusive: false,
            max_length: None,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub no_ack: bool,
    pub consumer_tag: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteOk {
    pub message_count: usize,
}

/// Serializable queue snapshot: name, declaration options and the messages
/// worth restoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub name: QueueName,
    pub options: QueueOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageState>,
}

pub(crate) struct QueueInner {
    options: QueueOptions,
    ctl: Mutex<QueueCtl>,
    events: EventHub<QueueEvent>,
}

struct QueueCtl {
    name: QueueName,
    messages: VecDeque<Message>,
    consumers: Vec<Consumer>,
    /// Messages in storage that are not claimed by anyone.
    available: usize,
    stopped: bool,
}

impl QueueCtl {
    fn capacity(&self, options: &QueueOptions) -> usize {
        options
            .max_length
            .map_or(usize::MAX, |max| max.saturating_sub(self.messages.len()))
    }
}

/// Ordered message store with a priority-sorted consumer registry. Handles
/// are cheap clones sharing one instance; every operation is an ordinary
/// synchronous call and no internal lock is ever held across a callback.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub fn new(name: impl Into<QueueName>, options: QueueOptions) -> Queue {
        Queue {
            inner: Arc::new(QueueInner {
                options,
                ctl: Mutex::new(QueueCtl {
                    name: name.into(),
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    available: 0,
                    stopped: false,
                }),
                events: EventHub::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Queue {
        Queue { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<QueueInner> {
        Arc::downgrade(&self.inner)
    }

    fn ctl(&self) -> MutexGuard<'_, QueueCtl> {
        self.inner.ctl.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> QueueName {
        self.ctl().name.clone()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    pub fn message_count(&self) -> usize {
        self.ctl().messages.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.ctl().consumers.len()
    }

    /// Remaining free slots; unbounded queues report `usize::MAX`.
    pub fn capacity(&self) -> usize {
        let ctl = self.ctl();
        ctl.capacity(&self.inner.options)
    }

    pub fn is_stopped(&self) -> bool {
        self.ctl().stopped
    }

    pub fn on(&self, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// The hook a message reports back through when it gets resolved.
    fn resolution_hook(&self) -> OnConsumed {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |message, operation, all_up_to, requeue| {
            if let Some(inner) = weak.upgrade() {
                Queue { inner }.resolve(message, operation, all_up_to, requeue);
            }
        })
    }

    /// Append a message at the tail and dispatch. Returns the number of
    /// messages handed to consumers, or `None` when the queue is stopped or
    /// the capacity policy dropped this publish.
    pub fn queue_message(
        &self,
        fields: MessageFields,
        content: Content,
        properties: MessageProperties,
    ) -> Option<usize> {
        let mut properties = properties;
        let (capacity_before, message) = {
            let mut ctl = self.ctl();
            if ctl.stopped {
                return None;
            }
            if properties.expiration.is_none() {
                properties.expiration = self.inner.options.message_ttl;
            }
            let message = Message::new(fields, content, properties, Some(self.resolution_hook()));
            let capacity = ctl.capacity(&self.inner.options);
            ctl.messages.push_back(message.clone());
            ctl.available += 1;
            (capacity, message)
        };

        let discarded = match capacity_before {
            0 => self.evict_first(&message),
            1 => {
                self.inner.events.emit(&QueueEvent::Saturated);
                false
            }
            _ => false,
        };
        self.inner.events.emit(&QueueEvent::Message(message.clone()));

        if discarded {
            debug!(queue_name = %self.name(), message_id = %message.message_id(), "publish dropped by capacity policy");
            return None;
        }
        Some(self.consume_next())
    }

    /// Force out the oldest non-pending message. Reports whether the victim
    /// was the message that was just inserted.
    fn evict_first(&self, just_queued: &Message) -> bool {
        let Some(evicted) = self.get(GetOptions::default()) else {
            return false;
        };
        evicted.nack(false, false);
        evicted.same_message(just_queued)
    }

    /// Register a consumer and flush whatever is immediately available.
    #[instrument(skip_all, fields(queue_name = %self.name()))]
    pub fn consume(
        &self,
        on_message: OnMessage,
        options: ConsumerOptions,
        owner: Option<Owner>,
    ) -> Result<Consumer, RoostError> {
        if let Some(tag) = &options.consumer_tag {
            if tag.is_empty() {
                return Err(RoostError::InvalidArgument(
                    "consumer tag must not be empty".to_string(),
                ));
            }
        }
        if options.prefetch == 0 {
            return Err(RoostError::InvalidArgument(
                "prefetch must be greater than zero".to_string(),
            ));
        }
        {
            let ctl = self.ctl();
            if ctl.consumers.iter().any(|c| c.is_exclusive()) {
                return Err(RoostError::Conflict(format!(
                    "queue '{}' is exclusively consumed",
                    ctl.name
                )));
            }
            if options.exclusive && !ctl.consumers.is_empty() {
                return Err(RoostError::Conflict(format!(
                    "queue '{}' already has consumers, exclusive consume refused",
                    ctl.name
                )));
            }
            if let Some(tag) = &options.consumer_tag {
                if ctl.consumers.iter().any(|c| c.consumer_tag() == *tag) {
                    return Err(RoostError::Conflict(format!(
                        "consumer tag '{}' is already taken",
                        tag
                    )));
                }
            }
        }

        let consumer = Consumer::new(self, on_message, options, owner);
        {
            let mut ctl = self.ctl();
            let priority = consumer.priority();
            let position = ctl
                .consumers
                .iter()
                .position(|c| c.priority() < priority)
                .unwrap_or(ctl.consumers.len());
            ctl.consumers.insert(position, consumer.clone());
        }
        info!(consumer_tag = %consumer.consumer_tag(), "consumer registered");
        self.inner.events.emit(&QueueEvent::Consume {
            consumer_tag: consumer.consumer_tag(),
        });
        self.consume_next();
        Ok(consumer)
    }

    /// Idempotent consume: hand back an existing consumer matching the same
    /// callback plus tag/exclusivity constraints, create one otherwise.
    pub fn assert_consumer(
        &self,
        on_message: OnMessage,
        options: ConsumerOptions,
        owner: Option<Owner>,
    ) -> Result<Consumer, RoostError> {
        let existing = {
            let ctl = self.ctl();
            ctl.consumers
                .iter()
                .find(|c| {
                    if !c.matches_callback(&on_message) {
                        return false;
                    }
                    if let Some(tag) = &options.consumer_tag {
                        if c.consumer_tag() != *tag {
                            return false;
                        }
                    } else if c.is_exclusive() != options.exclusive {
                        return false;
                    }
                    true
                })
                .cloned()
        };
        match existing {
            Some(consumer) => Ok(consumer),
            None => self.consume(on_message, options, owner),
        }
    }

    /// Synchronous single pull bypassing consumers. With `no_ack` the
    /// message leaves storage immediately.
    pub fn get(&self, options: GetOptions) -> Option<Message> {
        let message = self
            .consume_messages(1, options.consumer_tag.as_deref())
            .into_iter()
            .next()?;
        if options.no_ack {
            self.dequeue(&message);
        }
        Some(message)
    }

    pub fn ack(&self, message: &Message, all_up_to: bool) {
        message.ack(all_up_to);
    }

    pub fn nack(&self, message: &Message, all_up_to: bool, requeue: bool) {
        message.nack(all_up_to, requeue);
    }

    pub fn reject(&self, message: &Message, requeue: bool) {
        message.reject(requeue);
    }

    pub fn ack_all(&self) {
        for message in self.pending_messages() {
            message.ack(false);
        }
    }

    pub fn nack_all(&self, requeue: bool) {
        for message in self.pending_messages() {
            message.nack(false, requeue);
        }
    }

    fn pending_messages(&self) -> Vec<Message> {
        self.ctl()
            .messages
            .iter()
            .filter(|m| m.is_pending())
            .cloned()
            .collect()
    }

    /// Head of the queue without claiming; `ignore_pending` skips messages
    /// currently in flight.
    pub fn peek(&self, ignore_pending: bool) -> Option<Message> {
        let ctl = self.ctl();
        if ignore_pending {
            ctl.messages.iter().find(|m| !m.is_pending()).cloned()
        } else {
            ctl.messages.front().cloned()
        }
    }

    /// Drop every non-pending message; in-flight messages survive.
    pub fn purge(&self) -> usize {
        let (purged, empty) = {
            let mut ctl = self.ctl();
            let before = ctl.messages.len();
            ctl.messages.retain(|m| m.is_pending());
            ctl.available = 0;
            (before - ctl.messages.len(), ctl.messages.is_empty())
        };
        if empty {
            self.inner.events.emit(&QueueEvent::Depleted);
        }
        purged
    }

    #[instrument(skip_all, fields(queue_name = %self.name(), consumer_tag = %consumer_tag))]
    pub fn cancel(&self, consumer_tag: &str) -> bool {
        let consumer = {
            let ctl = self.ctl();
            ctl.consumers
                .iter()
                .find(|c| c.consumer_tag() == consumer_tag)
                .cloned()
        };
        match consumer {
            Some(consumer) => {
                consumer.cancel(true);
                true
            }
            None => false,
        }
    }

    /// Remove the consumer registered with this exact callback.
    pub fn dismiss(&self, on_message: &OnMessage) -> bool {
        let consumer = {
            let ctl = self.ctl();
            ctl.consumers
                .iter()
                .find(|c| c.matches_callback(on_message))
                .cloned()
        };
        match consumer {
            Some(consumer) => {
                consumer.cancel(true);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unregister(&self, consumer_tag: &str) {
        let removed = {
            let mut ctl = self.ctl();
            let before = ctl.consumers.len();
            ctl.consumers.retain(|c| c.consumer_tag() != consumer_tag);
            ctl.consumers.len() != before
        };
        if removed {
            self.inner.events.emit(&QueueEvent::ConsumerCancel {
                consumer_tag: consumer_tag.to_string(),
            });
        }
    }

    /// Refuses with `None` when a constraint is violated; otherwise stops
    /// the queue, cancels all consumers with requeue, clears storage.
    #[instrument(skip_all, fields(queue_name = %self.name()))]
    pub fn delete(&self, options: DeleteOptions) -> Option<DeleteOk> {
        {
            let ctl = self.ctl();
            if options.if_unused && !ctl.consumers.is_empty() {
                warn!("refusing delete, queue still has consumers");
                return None;
            }
            if options.if_empty && !ctl.messages.is_empty() {
                warn!("refusing delete, queue still has messages");
                return None;
            }
        }
        self.stop();
        let consumers: Vec<Consumer> = self.ctl().consumers.clone();
        for consumer in consumers {
            consumer.cancel(true);
        }
        let message_count = {
            let mut ctl = self.ctl();
            let count = ctl.messages.len();
            ctl.messages.clear();
            ctl.available = 0;
            count
        };
        info!(message_count, "queue deleted");
        self.inner.events.emit(&QueueEvent::Delete);
        Some(DeleteOk { message_count })
    }

    pub fn close(&self) {
        let consumers: Vec<Consumer> = self.ctl().consumers.clone();
        for consumer in consumers {
            consumer.cancel(true);
        }
        self.inner.events.emit(&QueueEvent::Close);
    }

    /// While stopped, message flow is a no-op; structural operations still
    /// succeed and take effect on recovery.
    pub fn stop(&self) {
        let consumers = {
            let mut ctl = self.ctl();
            ctl.stopped = true;
            ctl.consumers.clone()
        };
        for consumer in consumers {
            consumer.stop();
        }
    }

    pub fn get_state(&self) -> Result<QueueState, RoostError> {
        let ctl = self.ctl();
        let mut messages = Vec::new();
        for message in &ctl.messages {
            if message.properties().persistent == Some(false) {
                continue;
            }
            match message.to_state() {
                Some(state) => messages.push(state),
                None => {
                    return Err(RoostError::NotSerializable {
                        queue: ctl.name.clone(),
                    })
                }
            }
        }
        Ok(QueueState {
            name: ctl.name.clone(),
            options: self.inner.options.clone(),
            messages,
        })
    }

    /// Without state: clear `stopped` and resume dispatch with the existing
    /// consumers. With state: replace name and contents, restore only
    /// persistent messages (marked redelivered), reset consumer buffers.
    #[instrument(skip_all, fields(queue_name = %self.name()))]
    pub fn recover(&self, state: Option<&QueueState>) {
        let consumers: Vec<Consumer> = match state {
            None => {
                let mut ctl = self.ctl();
                ctl.stopped = false;
                ctl.consumers.clone()
            }
            Some(state) => {
                let hook = self.resolution_hook();
                let mut ctl = self.ctl();
                ctl.stopped = false;
                ctl.name = state.name.clone();
                ctl.messages.clear();
                for message_state in &state.messages {
                    if message_state.properties.persistent == Some(false) {
                        continue;
                    }
                    let mut fields = message_state.fields.clone();
                    fields.redelivered = true;
                    ctl.messages.push_back(Message::new(
                        fields,
                        Content::json(message_state.content.clone()),
                        message_state.properties.clone(),
                        Some(hook.clone()),
                    ));
                }
                ctl.available = ctl.messages.len();
                info!(restored = ctl.messages.len(), "queue state restored");
                ctl.consumers.clone()
            }
        };
        let reset_buffers = state.is_some();
        for consumer in &consumers {
            if reset_buffers {
                consumer.recover();
            } else {
                consumer.resume();
            }
        }
        self.consume_next();
    }

    pub(crate) fn snapshot_messages(&self) -> Vec<Message> {
        self.ctl().messages.iter().cloned().collect()
    }

    /// Dispatch loop: serve ready consumers in priority order, each up to
    /// its remaining prefetch capacity. Consumers at zero capacity are
    /// skipped and retry on the next publish or ack cycle.
    fn consume_next(&self) -> usize {
        let consumers = {
            let ctl = self.ctl();
            if ctl.stopped || ctl.available == 0 {
                return 0;
            }
            // stable snapshot, cancellation mid-loop cannot corrupt iteration
            ctl.consumers.clone()
        };
        let mut taken = 0;
        for consumer in consumers {
            if !consumer.is_ready() {
                continue;
            }
            let capacity = consumer.capacity();
            if capacity == 0 {
                continue;
            }
            let tag = consumer.consumer_tag();
            let batch = self.consume_messages(capacity, Some(tag.as_str()));
            if batch.is_empty() {
                break;
            }
            taken += batch.len();
            consumer.push(batch);
        }
        taken
    }

    /// Claim up to `count` messages from the head, skipping pending ones and
    /// lazily evicting expired ones.
    fn consume_messages(&self, count: usize, consumer_tag: Option<&str>) -> Vec<Message> {
        let (batch, expired) = {
            let mut ctl = self.ctl();
            if ctl.stopped || ctl.available == 0 || count == 0 {
                return Vec::new();
            }
            let now = now_millis();
            let mut batch = Vec::new();
            let mut expired = Vec::new();
            for message in ctl.messages.iter() {
                if message.is_pending() {
                    continue;
                }
                if message.is_expired(now) {
                    expired.push(message.clone());
                    continue;
                }
                message.consume(consumer_tag, None);
                batch.push(message.clone());
                if batch.len() == count {
                    break;
                }
            }
            ctl.available -= batch.len();
            (batch, expired)
        };
        for message in expired {
            debug!(message_id = %message.message_id(), "evicting expired message");
            self.resolve(&message, Operation::Nack, false, false);
        }
        batch
    }

    fn dequeue(&self, message: &Message) -> bool {
        let mut ctl = self.ctl();
        let Some(position) = ctl.messages.iter().position(|m| m.same_message(message)) else {
            return false;
        };
        ctl.messages.remove(position);
        if !message.is_pending() {
            ctl.available = ctl.available.saturating_sub(1);
        }
        true
    }

    /// Resolution handler shared by every entry point: mutate storage, emit
    /// the bookkeeping events, feed the dead-letter target, replay older
    /// pending messages for allUpTo, then dispatch again.
    fn resolve(&self, message: &Message, operation: Operation, all_up_to: bool, requeue: bool) {
        let inner = &self.inner;
        let (mutated, message_count, capacity, queue_name, dead_letter, pending_before) = {
            let mut ctl = self.ctl();
            if ctl.stopped {
                return;
            }
            let position = ctl.messages.iter().position(|m| m.same_message(message));
            let pending_before: Vec<Message> = match (all_up_to, position) {
                (true, Some(position)) => ctl
                    .messages
                    .iter()
                    .take(position)
                    .filter(|m| m.is_pending())
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            let mut dead_letter = false;
            if let Some(position) = position {
                match (operation, requeue) {
                    (Operation::Ack, _) => {
                        remove_at(&mut ctl, position, message);
                    }
                    (Operation::Nack | Operation::Reject, true) => {
                        let replacement =
                            message.redelivered_copy(Some(self.resolution_hook()));
                        ctl.messages[position] = replacement;
                        ctl.available += 1;
                    }
                    (Operation::Nack | Operation::Reject, false) => {
                        remove_at(&mut ctl, position, message);
                        dead_letter = inner.options.dead_letter_exchange.is_some();
                    }
                }
            }
            (
                position.is_some(),
                ctl.messages.len(),
                ctl.capacity(&inner.options),
                ctl.name.clone(),
                dead_letter,
                pending_before,
            )
        };

        if mutated {
            if message_count == 0 {
                inner.events.emit(&QueueEvent::Depleted);
            } else if capacity == 1 {
                inner.events.emit(&QueueEvent::Ready { capacity });
            }
        }

        if dead_letter {
            if let Some(dead_letter_exchange) = inner.options.dead_letter_exchange.clone() {
                let mut fields = message.fields();
                if let Some(routing_key) = &inner.options.dead_letter_routing_key {
                    fields.routing_key = routing_key.clone();
                }
                let mut properties = message.properties().clone();
                properties.expiration = None;
                let dead = Message::new(fields, message.content().clone(), properties, None);
                debug!(message_id = %dead.message_id(), %dead_letter_exchange, "dead-lettering message");
                inner.events.emit(&QueueEvent::DeadLetter {
                    source_queue: queue_name,
                    dead_letter_exchange,
                    message: dead,
                });
            }
        }

        let requeued = matches!(operation, Operation::Nack | Operation::Reject) && requeue;
        if message.properties().confirm && !requeued {
            inner.events.emit(&QueueEvent::MessageConsumed {
                operation,
                message: message.clone(),
            });
        }

        for older in pending_before {
            match operation {
                Operation::Ack => older.ack(false),
                Operation::Nack => older.nack(false, requeue),
                Operation::Reject => older.reject(requeue),
            }
        }

        self.consume_next();
    }
}

fn remove_at(ctl: &mut QueueCtl, position: usize, message: &Message) {
    ctl.messages.remove(position);
    if !message.is_pending() {
        ctl.available = ctl.available.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Once;
    use std::time::Duration;

    use super::*;
    use serde_json::json;

    static ONCE: Once = Once::new();

    fn init_tracing() {
        ONCE.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    fn fields(routing_key: &str) -> MessageFields {
        MessageFields::new(routing_key, "test-exchange")
    }

    fn publish(queue: &Queue, routing_key: &str) -> Option<usize> {
        queue.queue_message(
            fields(routing_key),
            Content::json(json!(routing_key)),
            MessageProperties::default(),
        )
    }

    fn publish_with(queue: &Queue, routing_key: &str, properties: MessageProperties) -> Option<usize> {
        queue.queue_message(fields(routing_key), Content::json(json!(routing_key)), properties)
    }

    fn collected_events(queue: &Queue) -> Arc<Mutex<Vec<QueueEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        queue.on(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[test]
    fn stores_messages_in_fifo_order() {
        init_tracing();
        let queue = Queue::new("fifo-q", QueueOptions::default());
        publish(&queue, "first");
        publish(&queue, "second");
        publish(&queue, "third");

        assert_eq!(queue.message_count(), 3);
        assert_eq!(queue.get(GetOptions::default()).unwrap().routing_key(), "first");
        assert_eq!(queue.get(GetOptions::default()).unwrap().routing_key(), "second");
        assert_eq!(queue.get(GetOptions::default()).unwrap().routing_key(), "third");
    }

    #[test]
    fn applies_queue_default_ttl_only_when_message_has_none() {
        let queue = Queue::new(
            "ttl-q",
            QueueOptions {
                message_ttl: Some(60_000),
                ..QueueOptions::default()
            },
        );
        publish(&queue, "defaulted");
        publish_with(
            &queue,
            "explicit",
            MessageProperties {
                expiration: Some(5_000),
                ..Default::default()
            },
        );

        let defaulted = queue.get(GetOptions::default()).unwrap();
        assert_eq!(defaulted.properties().expiration, Some(60_000));
        let explicit = queue.get(GetOptions::default()).unwrap();
        assert_eq!(explicit.properties().expiration, Some(5_000));
    }

    #[test]
    fn evicts_oldest_non_pending_message_on_overflow() {
        let queue = Queue::new(
            "bounded-q",
            QueueOptions {
                max_length: Some(2),
                ..QueueOptions::default()
            },
        );
        assert!(publish(&queue, "one").is_some());
        assert!(publish(&queue, "two").is_some());
        // "one" is evicted, the new publish is not dropped
        assert!(publish(&queue, "three").is_some());

        assert_eq!(queue.message_count(), 2);
        assert_eq!(queue.peek(false).unwrap().routing_key(), "two");
    }

    #[test]
    fn reports_dropped_publish_when_everything_else_is_pending() {
        let queue = Queue::new(
            "pending-q",
            QueueOptions {
                max_length: Some(1),
                ..QueueOptions::default()
            },
        );
        publish(&queue, "in-flight");
        let claimed = queue.get(GetOptions::default()).unwrap();
        assert!(claimed.is_pending());

        // the only evictable message is the one being inserted
        assert_eq!(publish(&queue, "dropped"), None);
        assert_eq!(queue.message_count(), 1);
        assert_eq!(queue.peek(false).unwrap().routing_key(), "in-flight");
    }

    #[test]
    fn max_length_zero_discards_every_insert() {
        let queue = Queue::new(
            "null-q",
            QueueOptions {
                max_length: Some(0),
                ..QueueOptions::default()
            },
        );
        for _ in 0..5 {
            assert_eq!(publish(&queue, "discarded"), None);
            assert_eq!(queue.message_count(), 0);
        }
    }

    #[test]
    fn emits_saturated_ready_and_depleted() {
        let queue = Queue::new(
            "signal-q",
            QueueOptions {
                max_length: Some(2),
                ..QueueOptions::default()
            },
        );
        let events = collected_events(&queue);

        publish(&queue, "one");
        publish(&queue, "two");
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::Saturated)));

        let first = queue.get(GetOptions::default()).unwrap();
        first.ack(false);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::Ready { capacity: 1 })));

        let second = queue.get(GetOptions::default()).unwrap();
        second.ack(false);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::Depleted)));
    }

    #[test]
    fn repeated_get_never_returns_a_pending_message_twice() {
        let queue = Queue::new("claim-q", QueueOptions::default());
        publish(&queue, "one");
        publish(&queue, "two");

        let first = queue.get(GetOptions::default()).unwrap();
        let second = queue.get(GetOptions::default()).unwrap();
        assert!(!first.same_message(&second));
        assert!(queue.get(GetOptions::default()).is_none());
    }

    #[test]
    fn get_with_no_ack_dequeues_immediately() {
        let queue = Queue::new("noack-q", QueueOptions::default());
        publish(&queue, "one");
        let message = queue
            .get(GetOptions {
                no_ack: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(message.routing_key(), "one");
        assert_eq!(queue.message_count(), 0);
    }

    #[test]
    fn requeued_nack_splices_a_redelivered_replacement() {
        let queue = Queue::new("requeue-q", QueueOptions::default());
        publish(&queue, "one");
        publish(&queue, "two");
        publish(&queue, "three");
        let original_ids: Vec<String> = queue
            .snapshot_messages()
            .iter()
            .map(|m| m.message_id().to_string())
            .collect();

        let claimed: Vec<Message> = (0..3)
            .map(|_| queue.get(GetOptions::default()).unwrap())
            .collect();
        for message in &claimed {
            message.nack(false, true);
        }

        assert_eq!(queue.message_count(), 3);
        let replacements = queue.snapshot_messages();
        let replacement_ids: Vec<String> = replacements
            .iter()
            .map(|m| m.message_id().to_string())
            .collect();
        assert_eq!(replacement_ids, original_ids, "order must be preserved");
        for (replacement, original) in replacements.iter().zip(&claimed) {
            assert!(replacement.redelivered());
            assert!(!replacement.is_pending());
            assert!(!replacement.same_message(original));
        }
    }

    #[test]
    fn ack_all_up_to_resolves_older_pending_messages() {
        let queue = Queue::new("upto-q", QueueOptions::default());
        publish(&queue, "one");
        publish(&queue, "two");
        publish(&queue, "three");

        let _first = queue.get(GetOptions::default()).unwrap();
        let second = queue.get(GetOptions::default()).unwrap();
        second.ack(true);

        assert_eq!(queue.message_count(), 1);
        assert_eq!(queue.peek(false).unwrap().routing_key(), "three");
    }

    #[test]
    fn dead_letters_with_routing_key_override_and_stripped_expiration() {
        let queue = Queue::new(
            "dlx-q",
            QueueOptions {
                dead_letter_exchange: Some("dlx".to_string()),
                dead_letter_routing_key: Some("dead.key".to_string()),
                ..QueueOptions::default()
            },
        );
        let events = collected_events(&queue);
        publish_with(
            &queue,
            "orders.created",
            MessageProperties {
                expiration: Some(60_000),
                ..Default::default()
            },
        );

        let message = queue.get(GetOptions::default()).unwrap();
        message.nack(false, false);

        let events = events.lock().unwrap();
        let dead = events
            .iter()
            .find_map(|e| match e {
                QueueEvent::DeadLetter {
                    source_queue,
                    dead_letter_exchange,
                    message,
                } => Some((source_queue.clone(), dead_letter_exchange.clone(), message.clone())),
                _ => None,
            })
            .expect("dead-letter event");
        assert_eq!(dead.0, "dlx-q");
        assert_eq!(dead.1, "dlx");
        assert_eq!(dead.2.routing_key(), "dead.key");
        assert_eq!(dead.2.properties().expiration, None);
        assert_eq!(dead.2.message_id(), message.message_id());
    }

    #[test]
    fn expired_messages_are_evicted_at_consumption_time() {
        let queue = Queue::new(
            "expiry-q",
            QueueOptions {
                dead_letter_exchange: Some("dlx".to_string()),
                ..QueueOptions::default()
            },
        );
        let events = collected_events(&queue);
        publish_with(
            &queue,
            "short.lived",
            MessageProperties {
                expiration: Some(1),
                ..Default::default()
            },
        );
        std::thread::sleep(Duration::from_millis(10));

        assert!(queue.get(GetOptions::default()).is_none());
        assert_eq!(queue.message_count(), 0);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::DeadLetter { .. })));
    }

    #[test]
    fn confirm_property_emits_message_consumed() {
        let queue = Queue::new("confirm-q", QueueOptions::default());
        let events = collected_events(&queue);
        publish_with(
            &queue,
            "confirmed",
            MessageProperties {
                confirm: true,
                ..Default::default()
            },
        );

        let message = queue.get(GetOptions::default()).unwrap();
        message.ack(false);

        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            QueueEvent::MessageConsumed {
                operation: Operation::Ack,
                ..
            }
        )));
    }

    #[test]
    fn dispatches_by_consumer_priority_with_stable_ties() {
        let queue = Queue::new("priority-q", QueueOptions::default());
        let deliveries: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

        for (tag, priority) in [("low", 0), ("high-a", 2), ("high-b", 2)] {
            let sink = Arc::clone(&deliveries);
            let tag_owned = tag.to_string();
            let on_message: OnMessage = Arc::new(move |routing_key, _message, _owner| {
                sink.lock().unwrap().push((tag_owned.clone(), routing_key.to_string()));
            });
            queue
                .consume(
                    on_message,
                    ConsumerOptions {
                        consumer_tag: Some(tag.to_string()),
                        priority,
                        ..Default::default()
                    },
                    None,
                )
                .unwrap();
        }

        publish(&queue, "m1");
        publish(&queue, "m2");
        publish(&queue, "m3");

        let seen = deliveries.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("high-a".to_string(), "m1".to_string()),
                ("high-b".to_string(), "m2".to_string()),
                ("low".to_string(), "m3".to_string()),
            ]
        );
    }

    #[test]
    fn exclusive_consumer_rules() {
        let queue = Queue::new("exclusive-q", QueueOptions::default());
        let noop: OnMessage = Arc::new(|_routing_key, _message, _owner| {});

        queue
            .consume(
                Arc::clone(&noop),
                ConsumerOptions {
                    exclusive: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let err = queue
            .consume(Arc::clone(&noop), ConsumerOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, RoostError::Conflict(_)));

        let open_queue = Queue::new("open-q", QueueOptions::default());
        open_queue
            .consume(Arc::clone(&noop), ConsumerOptions::default(), None)
            .unwrap();
        let err = open_queue
            .consume(
                noop,
                ConsumerOptions {
                    exclusive: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, RoostError::Conflict(_)));
    }

    #[test]
    fn duplicate_consumer_tag_is_a_conflict() {
        let queue = Queue::new("tags-q", QueueOptions::default());
        let noop: OnMessage = Arc::new(|_routing_key, _message, _owner| {});
        let options = ConsumerOptions {
            consumer_tag: Some("ctag-1".to_string()),
            ..Default::default()
        };

        queue.consume(Arc::clone(&noop), options.clone(), None).unwrap();
        let err = queue.consume(noop, options, None).unwrap_err();
        assert_eq!(
            err,
            RoostError::Conflict("consumer tag 'ctag-1' is already taken".to_string())
        );
    }

    #[test]
    fn assert_consumer_is_idempotent_on_the_same_callback() {
        let queue = Queue::new("assert-q", QueueOptions::default());
        let on_message: OnMessage = Arc::new(|_routing_key, _message, _owner| {});

        let first = queue
            .assert_consumer(Arc::clone(&on_message), ConsumerOptions::default(), None)
            .unwrap();
        let second = queue
            .assert_consumer(Arc::clone(&on_message), ConsumerOptions::default(), None)
            .unwrap();
        assert_eq!(first.consumer_tag(), second.consumer_tag());
        assert_eq!(queue.consumer_count(), 1);

        let other: OnMessage = Arc::new(|_routing_key, _message, _owner| {});
        queue.assert_consumer(other, ConsumerOptions::default(), None).unwrap();
        assert_eq!(queue.consumer_count(), 2);
    }

    #[test]
    fn stopped_queue_ignores_message_flow_but_allows_structure() {
        init_tracing();
        let queue = Queue::new("stopped-q", QueueOptions::default());
        publish(&queue, "before");
        queue.stop();

        assert_eq!(publish(&queue, "while-stopped"), None);
        assert_eq!(queue.message_count(), 1);
        assert!(queue.get(GetOptions::default()).is_none());

        // resolution is a no-op while stopped
        let deliveries: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deliveries);
        let on_message: OnMessage = Arc::new(move |routing_key, _message, _owner| {
            sink.lock().unwrap().push(routing_key.to_string());
        });
        queue.consume(on_message, ConsumerOptions::default(), None).unwrap();
        assert!(deliveries.lock().unwrap().is_empty());

        queue.recover(None);
        assert_eq!(*deliveries.lock().unwrap(), vec!["before".to_string()]);
    }

    #[test]
    fn recover_with_state_restores_persistent_messages_as_redelivered() {
        let queue = Queue::new("durable-q", QueueOptions::default());
        publish(&queue, "kept");
        publish_with(
            &queue,
            "transient",
            MessageProperties {
                persistent: Some(false),
                ..Default::default()
            },
        );
        let state = queue.get_state().unwrap();
        assert_eq!(state.messages.len(), 1, "non-persistent messages are not captured");

        let restored = Queue::new("placeholder", QueueOptions::default());
        restored.recover(Some(&state));

        assert_eq!(restored.name(), "durable-q");
        assert_eq!(restored.message_count(), 1);
        let message = restored.get(GetOptions::default()).unwrap();
        assert_eq!(message.routing_key(), "kept");
        assert!(message.redelivered());
    }

    #[test]
    fn get_state_refuses_opaque_content() {
        let queue = Queue::new("opaque-q", QueueOptions::default());
        queue.queue_message(
            fields("opaque"),
            Content::opaque(Duration::from_secs(1)),
            MessageProperties::default(),
        );
        assert_eq!(
            queue.get_state().unwrap_err(),
            RoostError::NotSerializable {
                queue: "opaque-q".to_string()
            }
        );
    }

    #[test]
    fn delete_refuses_when_constraints_are_violated() {
        let queue = Queue::new("del-q", QueueOptions::default());
        let noop: OnMessage = Arc::new(|_routing_key, _message, _owner| {});
        queue.consume(noop, ConsumerOptions::default(), None).unwrap();
        assert!(queue
            .delete(DeleteOptions {
                if_unused: true,
                ..Default::default()
            })
            .is_none());

        publish(&queue, "still-here");
        assert!(queue
            .delete(DeleteOptions {
                if_empty: true,
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn delete_cancels_consumers_and_clears_messages() {
        let queue = Queue::new("del2-q", QueueOptions::default());
        let events = collected_events(&queue);
        let noop: OnMessage = Arc::new(|_routing_key, _message, _owner| {});
        queue
            .consume(
                noop,
                ConsumerOptions {
                    prefetch: 1,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        publish(&queue, "one");
        publish(&queue, "two");

        let result = queue.delete(DeleteOptions::default()).unwrap();
        assert_eq!(result.message_count, 2);
        assert_eq!(queue.message_count(), 0);
        assert_eq!(queue.consumer_count(), 0);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::Delete)));
    }

    #[test]
    fn purge_keeps_pending_messages() {
        let queue = Queue::new("purge-q", QueueOptions::default());
        publish(&queue, "one");
        publish(&queue, "two");
        publish(&queue, "three");
        let claimed = queue.get(GetOptions::default()).unwrap();

        assert_eq!(queue.purge(), 2);
        assert_eq!(queue.message_count(), 1);
        assert!(queue.peek(false).unwrap().same_message(&claimed));
    }

    #[test]
    fn peek_does_not_claim() {
        let queue = Queue::new("peek-q", QueueOptions::default());
        publish(&queue, "one");
        publish(&queue, "two");

        let head = queue.peek(false).unwrap();
        assert_eq!(head.routing_key(), "one");
        assert!(!head.is_pending());

        let _claimed = queue.get(GetOptions::default()).unwrap();
        assert_eq!(queue.peek(false).unwrap().routing_key(), "one");
        assert_eq!(queue.peek(true).unwrap().routing_key(), "two");
    }

    #[test]
    fn ack_all_and_nack_all_cover_every_pending_message() {
        let queue = Queue::new("bulk-q", QueueOptions::default());
        for key in ["one", "two", "three"] {
            publish(&queue, key);
        }
        let _a = queue.get(GetOptions::default()).unwrap();
        let _b = queue.get(GetOptions::default()).unwrap();
        queue.ack_all();
        assert_eq!(queue.message_count(), 1);

        let _c = queue.get(GetOptions::default()).unwrap();
        queue.nack_all(true);
        assert_eq!(queue.message_count(), 1);
        assert!(queue.peek(false).unwrap().redelivered());
    }

    #[test]
    fn capacity_invariant_holds_under_churn() {
        let queue = Queue::new(
            "invariant-q",
            QueueOptions {
                max_length: Some(3),
                ..QueueOptions::default()
            },
        );
        for round in 0..20 {
            publish(&queue, "m");
            assert!(queue.message_count() <= 3, "round {}", round);
            if round % 4 == 0 {
                if let Some(message) = queue.get(GetOptions::default()) {
                    message.nack(false, round % 8 == 0);
                }
            }
        }
        assert!(queue.message_count() <= 3);
    }
}
