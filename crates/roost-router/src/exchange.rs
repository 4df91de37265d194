use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use roost_core::{Consumer, ConsumerOptions, OnMessage, Queue, QueueOptions, QueueState};
use roost_internals::{
    Content, EventHub, ExchangeEvent, ExchangeName, HandlerId, Message, MessageFields,
    MessageProperties, QueueEvent, QueueName, RoostError,
};

use crate::strategies::{DirectStrategy, Matcher, RoutingStrategy, TopicStrategy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
}

impl ExchangeKind {
    fn strategy(&self) -> Box<dyn RoutingStrategy> {
        match self {
            ExchangeKind::Topic => Box::new(TopicStrategy),
            ExchangeKind::Direct => Box::new(DirectStrategy),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            auto_delete: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindOptions {
    pub priority: i32,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions { priority: 0 }
    }
}

/// Read-only view over a live binding.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingView {
    pub queue_name: QueueName,
    pub pattern: String,
    pub priority: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingState {
    pub queue_name: QueueName,
    pub pattern: String,
    #[serde(default)]
    pub options: BindOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeState {
    pub name: ExchangeName,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<BindingState>,
    /// Present for direct exchanges only: the round-robin path can hold a
    /// message in flight across the dispatch boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_queue: Option<QueueState>,
}

/// Durable snapshot of an engine topology: queues first, then exchanges,
/// then binding resolution by queue name on recovery.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerState {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exchanges: Vec<ExchangeState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queues: Vec<QueueState>,
}

struct Binding {
    queue: Queue,
    queue_name: QueueName,
    pattern: String,
    matcher: Matcher,
    options: BindOptions,
    queue_listener: HandlerId,
}

pub(crate) struct Selection {
    pub(crate) queue: Queue,
    pub(crate) queue_name: QueueName,
    pub(crate) pattern: String,
    pub(crate) multiple: bool,
}

pub(crate) struct ExchangeInner {
    name: ExchangeName,
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Mutex<Vec<Binding>>,
    /// Serializes publishes, including reentrant ones, into strict
    /// one-at-a-time processing through its single always-present consumer.
    delivery_queue: Queue,
    delivery_consumer: Mutex<Option<Consumer>>,
    strategy: Box<dyn RoutingStrategy>,
    events: EventHub<ExchangeEvent>,
}

impl ExchangeInner {
    fn bindings(&self) -> MutexGuard<'_, Vec<Binding>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queues behind every matching binding, in current binding order.
    pub(crate) fn matching_queues(&self, routing_key: &str) -> Vec<Queue> {
        self.bindings()
            .iter()
            .filter(|binding| binding.matcher.matches(routing_key))
            .map(|binding| binding.queue.clone())
            .collect()
    }

    /// Highest-priority matching binding; ties resolve to the earliest list
    /// position, which rotation turns into round-robin.
    pub(crate) fn best_match(&self, routing_key: &str) -> Option<Selection> {
        let bindings = self.bindings();
        let mut matches = bindings
            .iter()
            .filter(|binding| binding.matcher.matches(routing_key));
        let first = matches.next()?;
        let mut best = first;
        let mut count = 1;
        for binding in matches {
            count += 1;
            if binding.options.priority > best.options.priority {
                best = binding;
            }
        }
        Some(Selection {
            queue: best.queue.clone(),
            queue_name: best.queue_name.clone(),
            pattern: best.pattern.clone(),
            multiple: count > 1,
        })
    }

    /// Move the binding to the back of the list.
    pub(crate) fn rotate(&self, queue_name: &str, pattern: &str) {
        let mut bindings = self.bindings();
        if let Some(position) = bindings
            .iter()
            .position(|b| b.queue_name == queue_name && b.pattern == pattern)
        {
            let binding = bindings.remove(position);
            bindings.push(binding);
        }
    }

    pub(crate) fn emit_return_if_mandatory(&self, message: &Message) {
        if !message.properties().mandatory {
            debug!(exchange_name = %self.name, routing_key = %message.routing_key(), "unroutable message dropped");
            return;
        }
        let fields = MessageFields::new(message.routing_key(), self.name.clone());
        let returned = Message::new(
            fields,
            message.content().clone(),
            message.properties().clone(),
            None,
        );
        self.events.emit(&ExchangeEvent::Return(returned));
    }
}

/// AMQP-style exchange: a binding table plus a per-type routing strategy,
/// fed through an internal delivery queue.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl Exchange {
    pub fn new(name: impl Into<ExchangeName>, kind: ExchangeKind, options: ExchangeOptions) -> Exchange {
        let name = name.into();
        let delivery_queue = Queue::new(
            format!("{}-delivery-q", name),
            QueueOptions {
                durable: false,
                auto_delete: false,
                ..QueueOptions::default()
            },
        );
        let inner = Arc::new(ExchangeInner {
            name: name.clone(),
            kind,
            options,
            bindings: Mutex::new(Vec::new()),
            delivery_queue,
            delivery_consumer: Mutex::new(None),
            strategy: kind.strategy(),
            events: EventHub::new(),
        });

        let weak = Arc::downgrade(&inner);
        let on_delivery: OnMessage = Arc::new(move |_routing_key, message, _owner| {
            if let Some(exchange) = weak.upgrade() {
                exchange.strategy.deliver(&exchange, message);
            } else {
                message.ack(false);
            }
        });
        let consumer = inner.delivery_queue.consume(
            on_delivery,
            ConsumerOptions {
                consumer_tag: Some(format!("{}-delivery", name)),
                prefetch: 1,
                ..Default::default()
            },
            None,
        );
        if let Ok(consumer) = consumer {
            *inner.delivery_consumer.lock().unwrap_or_else(|e| e.into_inner()) = Some(consumer);
        }
        Exchange { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.inner.kind
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.delivery_queue.is_stopped()
    }

    pub fn binding_count(&self) -> usize {
        self.inner.bindings().len()
    }

    pub fn bindings(&self) -> Vec<BindingView> {
        self.inner
            .bindings()
            .iter()
            .map(|binding| BindingView {
                queue_name: binding.queue_name.clone(),
                pattern: binding.pattern.clone(),
                priority: binding.options.priority,
            })
            .collect()
    }

    pub fn on(&self, handler: impl Fn(&ExchangeEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// Enqueue a publish onto the internal delivery queue. Routing happens
    /// when the always-present delivery consumer drains it, which keeps
    /// concurrent and reentrant publishes in strict FIFO order.
    pub fn publish(&self, routing_key: &str, content: Content, properties: MessageProperties) {
        let fields = MessageFields::new(routing_key, self.inner.name.clone());
        self.inner.delivery_queue.queue_message(fields, content, properties);
    }

    /// Idempotent on `(queue, pattern)`; bindings are kept in descending
    /// priority order with stable ties. The binding watches its queue's
    /// delete event and unbinds itself.
    #[instrument(skip_all, fields(exchange_name = %self.inner.name, queue_name = %queue.name(), pattern = %pattern))]
    pub fn bind(&self, queue: &Queue, pattern: &str, options: BindOptions) -> BindingView {
        let queue_name = queue.name();
        {
            let bindings = self.inner.bindings();
            if let Some(existing) = bindings
                .iter()
                .find(|b| b.queue_name == queue_name && b.pattern == pattern)
            {
                return BindingView {
                    queue_name: existing.queue_name.clone(),
                    pattern: existing.pattern.clone(),
                    priority: existing.options.priority,
                };
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let listener_queue_name = queue_name.clone();
        let listener_pattern = pattern.to_string();
        let queue_listener = queue.on(move |event| {
            if matches!(event, QueueEvent::Delete) {
                if let Some(inner) = weak.upgrade() {
                    Exchange { inner }.unbind_named(&listener_queue_name, &listener_pattern);
                }
            }
        });

        let view = BindingView {
            queue_name: queue_name.clone(),
            pattern: pattern.to_string(),
            priority: options.priority,
        };
        let binding = Binding {
            queue: queue.clone(),
            queue_name: queue_name.clone(),
            pattern: pattern.to_string(),
            matcher: Matcher::compile(pattern),
            options,
            queue_listener,
        };
        {
            let mut bindings = self.inner.bindings();
            let position = bindings
                .iter()
                .position(|b| b.options.priority < binding.options.priority)
                .unwrap_or(bindings.len());
            bindings.insert(position, binding);
        }
        info!("queue bound");
        self.inner.events.emit(&ExchangeEvent::Bind {
            queue_name,
            pattern: pattern.to_string(),
        });
        view
    }

    pub fn unbind(&self, queue: &Queue, pattern: &str) {
        self.unbind_named(&queue.name(), pattern);
    }

    pub fn unbind_queue_by_name(&self, queue_name: &str) {
        let patterns: Vec<String> = self
            .inner
            .bindings()
            .iter()
            .filter(|b| b.queue_name == queue_name)
            .map(|b| b.pattern.clone())
            .collect();
        for pattern in patterns {
            self.unbind_named(queue_name, &pattern);
        }
    }

    #[instrument(skip_all, fields(exchange_name = %self.inner.name, queue_name = %queue_name, pattern = %pattern))]
    fn unbind_named(&self, queue_name: &str, pattern: &str) {
        let removed = {
            let mut bindings = self.inner.bindings();
            bindings
                .iter()
                .position(|b| b.queue_name == queue_name && b.pattern == pattern)
                .map(|position| bindings.remove(position))
        };
        let Some(binding) = removed else {
            return;
        };
        binding.queue.off(binding.queue_listener);
        info!("queue unbound");
        self.inner.events.emit(&ExchangeEvent::Unbind {
            queue_name: queue_name.to_string(),
            pattern: pattern.to_string(),
        });
        if self.inner.options.auto_delete && self.binding_count() == 0 {
            debug!(exchange_name = %self.inner.name, "last binding removed, auto-delete");
            self.inner.events.emit(&ExchangeEvent::Delete);
        }
    }

    /// Durable bindings by queue name, plus the delivery queue contents for
    /// direct exchanges (deliberate asymmetry with topic).
    pub fn get_state(&self) -> Result<ExchangeState, RoostError> {
        let bindings = self
            .inner
            .bindings()
            .iter()
            .filter(|binding| binding.queue.options().durable)
            .map(|binding| BindingState {
                queue_name: binding.queue_name.clone(),
                pattern: binding.pattern.clone(),
                options: binding.options.clone(),
            })
            .collect();
        let delivery_queue = match self.inner.kind {
            ExchangeKind::Direct => Some(self.inner.delivery_queue.get_state()?),
            ExchangeKind::Topic => None,
        };
        Ok(ExchangeState {
            name: self.inner.name.clone(),
            kind: self.inner.kind,
            options: self.inner.options.clone(),
            bindings,
            delivery_queue,
        })
    }

    /// Re-establish bindings through the registry's queue lookup; queue
    /// names that no longer resolve are skipped. Direct exchanges also
    /// replay their captured delivery queue.
    #[instrument(skip_all, fields(exchange_name = %self.inner.name))]
    pub fn recover<F>(&self, state: Option<&ExchangeState>, queue_lookup: F)
    where
        F: Fn(&str) -> Option<Queue>,
    {
        if let Some(state) = state {
            for binding in &state.bindings {
                match queue_lookup(&binding.queue_name) {
                    Some(queue) => {
                        self.bind(&queue, &binding.pattern, binding.options.clone());
                    }
                    None => {
                        warn!(queue_name = %binding.queue_name, "skipping binding, queue did not resolve");
                    }
                }
            }
            if self.inner.kind == ExchangeKind::Direct {
                if let Some(delivery_state) = &state.delivery_queue {
                    self.inner.delivery_queue.recover(Some(delivery_state));
                    return;
                }
            }
        }
        self.inner.delivery_queue.recover(None);
    }

    /// Publishes while stopped are dropped; `recover` resumes the flow.
    pub fn stop(&self) {
        self.inner.delivery_queue.stop();
    }

    pub fn close(&self) {
        let listeners: Vec<(Queue, HandlerId)> = self
            .inner
            .bindings()
            .iter()
            .map(|binding| (binding.queue.clone(), binding.queue_listener))
            .collect();
        for (queue, listener) in listeners {
            queue.off(listener);
        }
        let consumer = self
            .inner
            .delivery_consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(consumer) = consumer {
            consumer.cancel(true);
        }
        self.inner.delivery_queue.stop();
        self.inner.events.emit(&ExchangeEvent::Close);
    }
}
