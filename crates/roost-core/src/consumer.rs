use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, instrument};
use uuid::Uuid;

use roost_internals::{
    ConsumerEvent, ConsumerTag, Content, EventHub, HandlerId, Message, OnConsumed, QueueEvent,
    QueueName,
};

use crate::queue::{GetOptions, Queue, QueueInner, QueueOptions};

/// Opaque context the registry facade threads through to callbacks.
pub type Owner = Arc<dyn Any + Send + Sync>;

/// Delivery callback: `(routing_key, message, owner)`. The message handle
/// stays pending until the callback (or later code holding the handle)
/// resolves it, unless the consumer runs with `no_ack`.
pub type OnMessage = Arc<dyn Fn(&str, &Message, Option<&Owner>) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Generated when absent.
    pub consumer_tag: Option<ConsumerTag>,
    pub no_ack: bool,
    /// Maximum unacknowledged messages held concurrently.
    pub prefetch: usize,
    pub priority: i32,
    pub exclusive: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            consumer_tag: None,
            no_ack: false,
            prefetch: 1,
            priority: 0,
            exclusive: false,
        }
    }
}

struct ConsumerInner {
    tag: ConsumerTag,
    options: ConsumerOptions,
    on_message: OnMessage,
    owner: Option<Owner>,
    source: Weak<QueueInner>,
    /// Bounded to prefetch; exists purely to reuse the queue's
    /// saturated/depleted/ready signaling for flow control.
    internal: Queue,
    ready: AtomicBool,
    stopped: AtomicBool,
    consuming: AtomicBool,
    events: EventHub<ConsumerEvent>,
}

/// Per-subscription flow controller. The subscribed queue stages batches
/// into the internal queue, the pump loop then delivers one message at a
/// time to the user callback.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.inner.tag)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub(crate) fn new(
        queue: &Queue,
        on_message: OnMessage,
        options: ConsumerOptions,
        owner: Option<Owner>,
    ) -> Consumer {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("roost.ctag-{}", Uuid::new_v4()));
        let internal = Queue::new(
            format!("{}-q", tag),
            QueueOptions {
                durable: false,
                auto_delete: false,
                max_length: Some(options.prefetch),
                ..QueueOptions::default()
            },
        );
        let consumer = Consumer {
            inner: Arc::new(ConsumerInner {
                tag,
                options,
                on_message,
                owner,
                source: queue.downgrade(),
                internal,
                ready: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                events: EventHub::new(),
            }),
        };
        let weak = Arc::downgrade(&consumer.inner);
        consumer.inner.internal.on(move |event| {
            if let Some(inner) = weak.upgrade() {
                match event {
                    QueueEvent::Saturated => inner.ready.store(false, Ordering::SeqCst),
                    QueueEvent::Depleted | QueueEvent::Ready { .. } => {
                        inner.ready.store(true, Ordering::SeqCst)
                    }
                    _ => {}
                }
            }
        });
        consumer
    }

    pub fn consumer_tag(&self) -> ConsumerTag {
        self.inner.tag.clone()
    }

    pub fn queue_name(&self) -> Option<QueueName> {
        self.inner
            .source
            .upgrade()
            .map(|inner| Queue::from_inner(inner).name())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.options.exclusive
    }

    pub fn priority(&self) -> i32 {
        self.inner.options.priority
    }

    pub fn prefetch(&self) -> usize {
        self.inner.options.prefetch
    }

    pub fn no_ack(&self) -> bool {
        self.inner.options.no_ack
    }

    /// Remaining prefetch capacity.
    pub fn capacity(&self) -> usize {
        self.inner.internal.capacity()
    }

    /// Messages staged or delivered but not yet resolved.
    pub fn message_count(&self) -> usize {
        self.inner.internal.message_count()
    }

    pub fn on(&self, handler: impl Fn(&ConsumerEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    pub(crate) fn matches_callback(&self, other: &OnMessage) -> bool {
        Arc::ptr_eq(&self.inner.on_message, other)
    }

    /// Stage a batch from the subscribed queue and drain it to the callback.
    pub(crate) fn push(&self, messages: Vec<Message>) {
        for message in messages {
            let fields = message.fields();
            let properties = message.properties().clone();
            self.inner
                .internal
                .queue_message(fields, Content::opaque(message), properties);
        }
        self.pump();
    }

    /// Deliver staged messages one at a time. The `consuming` flag keeps a
    /// reentrant push (triggered from inside a callback) from nesting; the
    /// loop picks the new message up on its next turn, which is what
    /// serializes delivery.
    fn pump(&self) {
        let inner = &self.inner;
        if inner.consuming.swap(true, Ordering::SeqCst) {
            return;
        }
        while !inner.stopped.load(Ordering::SeqCst) {
            let Some(staged) = inner.internal.get(GetOptions::default()) else {
                break;
            };
            let Some(source) = staged.content().downcast_ref::<Message>().cloned() else {
                staged.ack(false);
                continue;
            };
            let release: OnConsumed = {
                let staged = staged.clone();
                Arc::new(move |_message, _operation, _all_up_to, _requeue| {
                    staged.ack(false);
                })
            };
            source.consume(Some(inner.tag.as_str()), Some(release));
            if inner.options.no_ack {
                source.ack(false);
            }
            (inner.on_message)(&source.routing_key(), &source, inner.owner.as_ref());
        }
        inner.consuming.store(false, Ordering::SeqCst);
    }

    /// Stop dispatch and hand buffered-but-undelivered messages back to the
    /// source queue.
    #[instrument(skip_all, fields(consumer_tag = %self.inner.tag))]
    pub fn cancel(&self, requeue: bool) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = inner.source.upgrade() {
            Queue::from_inner(source).unregister(&inner.tag);
        }
        let undelivered: Vec<Message> = inner
            .internal
            .snapshot_messages()
            .iter()
            .filter(|staged| !staged.is_pending())
            .filter_map(|staged| staged.content().downcast_ref::<Message>().cloned())
            .collect();
        inner.internal.purge();
        inner.internal.stop();
        debug!(requeued = undelivered.len(), "consumer cancelled");
        for source in undelivered {
            source.nack(false, requeue);
        }
        inner.events.emit(&ConsumerEvent::Cancel {
            consumer_tag: inner.tag.clone(),
        });
    }

    pub fn ack_all(&self) {
        for source in self.staged_sources() {
            source.ack(false);
        }
    }

    pub fn nack_all(&self, requeue: bool) {
        for source in self.staged_sources() {
            source.nack(false, requeue);
        }
    }

    fn staged_sources(&self) -> Vec<Message> {
        self.inner
            .internal
            .snapshot_messages()
            .iter()
            .filter_map(|staged| staged.content().downcast_ref::<Message>().cloned())
            .collect()
    }

    /// Reset flow-control bookkeeping after the source queue restored its
    /// state: the staged copies refer to replaced messages and are dropped.
    pub(crate) fn recover(&self) {
        for source in self.staged_sources() {
            source.nack(false, false);
        }
        self.inner.internal.purge();
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.pump();
    }

    pub(crate) fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}
