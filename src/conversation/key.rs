use std::fmt;

use serde::{Deserialize, Serialize};

const SEPARATOR: char = ':';

/// Canonical identity of a conversation: `(user, tab group, tab)`.
///
/// Equality is by canonical string. Components are escaped so that two
/// different triples can never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(user_id: &str, tab_group_id: &str, tab_id: &str) -> Self {
        let mut key = String::with_capacity(user_id.len() + tab_group_id.len() + tab_id.len() + 2);
        escape_into(&mut key, user_id);
        key.push(SEPARATOR);
        escape_into(&mut key, tab_group_id);
        key.push(SEPARATOR);
        escape_into(&mut key, tab_id);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_into(out: &mut String, component: &str) {
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%3A"),
            _ => out.push(ch),
        }
    }
}
