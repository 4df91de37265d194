use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{MessageFields, MessageProperties};

/// Serializable shape of a single queued message. Queue and exchange state
/// shapes live next to their components; this is the common leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageState {
    pub fields: MessageFields,
    pub content: Value,
    pub properties: MessageProperties,
}
