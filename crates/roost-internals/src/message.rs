use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::MessageState;
use crate::{ConsumerTag, ExchangeName};

/// Milliseconds since UNIX_EPOCH, the clock every lazy TTL check runs on.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Opaque message payload. The engine never inspects it; a copy per bound
/// queue is just another handle to the same underlying value.
///
/// Content built from a [`serde_json::Value`] is snapshot-capable; anything
/// else makes state capture fail for the owning queue.
#[derive(Clone)]
pub struct Content(Arc<dyn Any + Send + Sync>);

impl Content {
    pub fn json(value: Value) -> Self {
        Content(Arc::new(value))
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Content(Arc::new(value))
    }

    pub fn empty() -> Self {
        Content::json(Value::Null)
    }

    pub fn as_json(&self) -> Option<&Value> {
        self.0.downcast_ref()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::empty()
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::json(value)
    }
}

impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_json(), other.as_json()) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::ptr_eq(&self.0, &other.0),
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_json() {
            Some(value) => write!(f, "Content({})", value),
            None => write!(f, "Content(<opaque>)"),
        }
    }
}

/// How a pending message was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Ack,
    Nack,
    Reject,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Ack => write!(f, "ack"),
            Operation::Nack => write!(f, "nack"),
            Operation::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFields {
    pub routing_key: String,
    pub exchange: ExchangeName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<ConsumerTag>,
    #[serde(default)]
    pub redelivered: bool,
}

impl MessageFields {
    pub fn new(routing_key: impl Into<String>, exchange: impl Into<ExchangeName>) -> Self {
        MessageFields {
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            consumer_tag: None,
            redelivered: false,
        }
    }
}

fn is_false(flag: &bool) -> bool {
    !flag
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Relative TTL in milliseconds, turned into an absolute deadline when
    /// the message is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
    /// `Some(false)` excludes the message from queue state capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(skip_serializing_if = "is_false")]
    pub mandatory: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub confirm: bool,
    /// Arbitrary caller metadata, carried untouched.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub headers: serde_json::Map<String, Value>,
}

/// Resolution hook invoked with `(message, operation, all_up_to, requeue)`.
pub type OnConsumed = Arc<dyn Fn(&Message, Operation, bool, bool) + Send + Sync>;

/// Hook slots: the claimant's hook runs first so a consumer can release its
/// prefetch slot before the owning queue dispatches the next round.
#[derive(Default)]
struct Hooks {
    claimant: Option<OnConsumed>,
    owner: Option<OnConsumed>,
}

struct MessageInner {
    fields: Mutex<MessageFields>,
    properties: MessageProperties,
    content: Content,
    ttl: Option<u64>,
    pending: AtomicBool,
    hooks: Mutex<Hooks>,
}

/// Message envelope handle. Clones share the same underlying instance, so
/// the pending flag and resolution travel with every copy of the handle.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub fn new(
        fields: MessageFields,
        content: Content,
        properties: MessageProperties,
        on_consumed: Option<OnConsumed>,
    ) -> Self {
        let mut properties = properties;
        if properties.message_id.is_none() {
            properties.message_id = Some(format!("roost.mid-{}", Uuid::new_v4()));
        }
        if properties.timestamp.is_none() {
            properties.timestamp = Some(now_millis());
        }
        let ttl = properties.expiration.map(|expiration| now_millis() + expiration);
        Message {
            inner: Arc::new(MessageInner {
                fields: Mutex::new(fields),
                properties,
                content,
                ttl,
                pending: AtomicBool::new(false),
                hooks: Mutex::new(Hooks {
                    claimant: None,
                    owner: on_consumed,
                }),
            }),
        }
    }

    /// Replacement instance for a requeued nack: same content and properties
    /// (including `message_id`), marked redelivered, fresh lifecycle.
    pub fn redelivered_copy(&self, on_consumed: Option<OnConsumed>) -> Message {
        let mut fields = self.fields();
        fields.redelivered = true;
        Message::new(
            fields,
            self.content().clone(),
            self.properties().clone(),
            on_consumed,
        )
    }

    pub fn fields(&self) -> MessageFields {
        self.inner.fields.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn routing_key(&self) -> String {
        self.fields().routing_key
    }

    pub fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.fields().consumer_tag
    }

    pub fn redelivered(&self) -> bool {
        self.fields().redelivered
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.inner.properties
    }

    pub fn message_id(&self) -> &str {
        self.inner.properties.message_id.as_deref().unwrap_or_default()
    }

    pub fn content(&self) -> &Content {
        &self.inner.content
    }

    pub fn ttl(&self) -> Option<u64> {
        self.inner.ttl
    }

    /// Lazy expiry check; the engine never runs timers.
    pub fn is_expired(&self, now: u64) -> bool {
        self.inner.ttl.map_or(false, |ttl| now > ttl)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Two handles to the very same message instance.
    pub fn same_message(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Claim the message: mark pending, record the claimant tag and install
    /// the claimant's resolution hook. Claiming again replaces the hook, so
    /// a redelivery never reports to a stale consumer.
    pub fn consume(&self, consumer_tag: Option<&str>, on_consumed: Option<OnConsumed>) {
        self.inner.pending.store(true, Ordering::SeqCst);
        {
            let mut fields = self.inner.fields.lock().unwrap_or_else(|e| e.into_inner());
            fields.consumer_tag = consumer_tag.map(str::to_string);
        }
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.claimant = on_consumed;
    }

    pub fn ack(&self, all_up_to: bool) {
        self.resolve(Operation::Ack, all_up_to, false);
    }

    pub fn nack(&self, all_up_to: bool, requeue: bool) {
        self.resolve(Operation::Nack, all_up_to, requeue);
    }

    pub fn reject(&self, requeue: bool) {
        self.resolve(Operation::Reject, false, requeue);
    }

    fn resolve(&self, operation: Operation, all_up_to: bool, requeue: bool) {
        if !self.inner.pending.load(Ordering::SeqCst) {
            return;
        }
        // The claimant hook is one-shot; the owner hook survives so the
        // queue keeps hearing about a message it declined to resolve while
        // stopped and later re-claims.
        let (claimant, owner) = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            (hooks.claimant.take(), hooks.owner.clone())
        };
        if let Some(hook) = claimant {
            hook(self, operation, all_up_to, requeue);
        }
        if let Some(hook) = owner {
            hook(self, operation, all_up_to, requeue);
        }
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    /// Serializable snapshot, or `None` when the content is not JSON.
    pub fn to_state(&self) -> Option<MessageState> {
        let content = self.content().as_json()?.clone();
        Some(MessageState {
            fields: self.fields(),
            content,
            properties: self.properties().clone(),
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("fields", &self.fields())
            .field("messageId", &self.message_id())
            .field("pending", &self.is_pending())
            .finish()
    }
}
