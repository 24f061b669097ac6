//! Conversation identity and the per-conversation run lock.
//!
//! A conversation is one browser tab of one user. At most one agent run may
//! execute per conversation; a second request for the same tab is refused
//! immediately instead of queueing behind the first.

mod key;
mod locks;

pub use key::ConversationKey;
pub use locks::{ConversationLocks, LockEntry};
