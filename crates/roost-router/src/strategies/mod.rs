pub mod direct;
pub mod topic;

pub use direct::DirectStrategy;
pub use topic::TopicStrategy;

use roost_core::Queue;
use roost_internals::{Message, MessageFields};

use crate::exchange::ExchangeInner;

/// Per-type delivery strategy. Each serialized publish is handed over as
/// the internal delivery-queue message; the strategy fans it out (or picks
/// a single target) and is responsible for resolving the delivery message.
pub(crate) trait RoutingStrategy: Send + Sync {
    fn deliver(&self, exchange: &ExchangeInner, message: &Message) -> u32;
}

/// Enqueue a copy of the published message into one bound queue. The copy
/// shares content and properties (including the message id), so identity
/// survives fan-out.
pub(crate) fn deliver_copy(queue: &Queue, exchange_name: &str, message: &Message) -> bool {
    let fields = MessageFields::new(message.routing_key(), exchange_name);
    queue
        .queue_message(fields, message.content().clone(), message.properties().clone())
        .is_some()
}

/// Routing-key matcher compiled once per binding. Keys and patterns are
/// dot-separated tokens; `*` matches exactly one token, `#` matches one or
/// more tokens and never the empty remainder, so `a.#.b` does not match
/// `a.b` while `#` alone matches every key.
#[derive(Clone, Debug, PartialEq)]
pub struct Matcher {
    tokens: Vec<Token>,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    One,
    Many,
}

impl Matcher {
    pub fn compile(pattern: &str) -> Matcher {
        let tokens = pattern
            .split('.')
            .map(|token| match token {
                "*" => Token::One,
                "#" => Token::Many,
                word => Token::Word(word.to_string()),
            })
            .collect();
        Matcher { tokens }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        Self::walk(&self.tokens, &words, 0, 0)
    }

    fn walk(tokens: &[Token], words: &[&str], token_idx: usize, word_idx: usize) -> bool {
        if token_idx >= tokens.len() {
            return word_idx >= words.len();
        }
        match &tokens[token_idx] {
            Token::Word(word) => {
                word_idx < words.len()
                    && words[word_idx] == word
                    && Self::walk(tokens, words, token_idx + 1, word_idx + 1)
            }
            Token::One => {
                word_idx < words.len() && Self::walk(tokens, words, token_idx + 1, word_idx + 1)
            }
            // '#' consumes at least one word, then either moves on or keeps eating
            Token::Many => {
                if word_idx >= words.len() {
                    return false;
                }
                Self::walk(tokens, words, token_idx + 1, word_idx + 1)
                    || Self::walk(tokens, words, token_idx, word_idx + 1)
            }
        }
    }
}
