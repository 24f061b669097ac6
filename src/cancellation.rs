//! Registry of in-flight runs that can be cancelled out of band.
//!
//! The request streaming a run's response and the request asking to stop it
//! are different HTTP calls. The registry decouples "who knows how to stop
//! this run" from "who wants to stop it".

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationKey;
use crate::util::lock;

/// Callback that asks a run to stop. Invoked at most once.
pub type CancelHandle = Box<dyn FnOnce() + Send + 'static>;

/// What a registered run belongs to, for cancelling before its request id is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    pub conversation: ConversationKey,
    pub workspace: String,
}

struct CancellationEntry {
    cancel: CancelHandle,
    registered_at: DateTime<Utc>,
    scope: Option<RunScope>,
    /// Fired by the run once its cleanup has finished.
    closed: Option<CancellationToken>,
}

/// Introspection view of a registry entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationInfo {
    pub request_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Map of request id to cancel handle.
///
/// # Invariants
/// - An entry is removed exactly once, by `cancel` or `unregister`.
/// - A handle is invoked at most once, outside the registry lock.
/// - Cancelling or unregistering an absent id is a silent no-op.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<String, CancellationEntry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: impl Into<String>, cancel: impl FnOnce() + Send + 'static) {
        self.insert(request_id.into(), Box::new(cancel), None, None);
    }

    /// Register a run together with its scope and a signal fired after its cleanup.
    pub fn register_run(
        &self,
        request_id: impl Into<String>,
        scope: RunScope,
        closed: CancellationToken,
        cancel: impl FnOnce() + Send + 'static,
    ) {
        self.insert(request_id.into(), Box::new(cancel), Some(scope), Some(closed));
    }

    fn insert(
        &self,
        request_id: String,
        cancel: CancelHandle,
        scope: Option<RunScope>,
        closed: Option<CancellationToken>,
    ) {
        let entry = CancellationEntry {
            cancel,
            registered_at: Utc::now(),
            scope,
            closed,
        };
        if lock(&self.entries).insert(request_id.clone(), entry).is_some() {
            tracing::warn!(request_id = %request_id, "Replaced an existing cancellation entry");
        }
    }

    /// Invoke and remove the handle for `request_id`. Returns false if absent.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.cancel_run(request_id).is_some()
    }

    /// Like [`cancel`](Self::cancel), but returns a token that fires once the
    /// run's cleanup has completed.
    pub fn cancel_run(&self, request_id: &str) -> Option<CancellationToken> {
        let entry = lock(&self.entries).remove(request_id)?;
        tracing::info!(request_id = %request_id, "Cancelling run");
        Some(invoke(entry))
    }

    /// Cancel every run registered for `conversation` in `workspace`.
    pub fn cancel_scope(
        &self,
        conversation: &ConversationKey,
        workspace: &str,
    ) -> Vec<(String, CancellationToken)> {
        let matched: Vec<(String, CancellationEntry)> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.scope.as_ref().is_some_and(|scope| {
                        &scope.conversation == conversation && scope.workspace == workspace
                    })
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        matched
            .into_iter()
            .map(|(id, entry)| {
                tracing::info!(
                    request_id = %id,
                    conversation = %conversation,
                    workspace = %workspace,
                    "Cancelling run by conversation"
                );
                (id, invoke(entry))
            })
            .collect()
    }

    /// Remove the entry without invoking its handle. Returns whether it was present.
    pub fn unregister(&self, request_id: &str) -> bool {
        lock(&self.entries).remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.entries).contains_key(request_id)
    }

    pub fn list(&self) -> Vec<CancellationInfo> {
        let mut infos: Vec<CancellationInfo> = lock(&self.entries)
            .iter()
            .map(|(id, entry)| CancellationInfo {
                request_id: id.clone(),
                registered_at: entry.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        infos
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn invoke(entry: CancellationEntry) -> CancellationToken {
    (entry.cancel)();
    entry.closed.unwrap_or_else(|| {
        // Plain registrations have no cleanup to wait for.
        let done = CancellationToken::new();
        done.cancel();
        done
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_invokes_once_and_removes() {
        let registry = CancellationRegistry::new();
        let (count, handle) = counter();
        registry.register("req-1", handle);
        assert!(registry.contains("req-1"));

        assert!(registry.cancel("req-1"));
        assert!(!registry.cancel("req-1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_of_unknown_id_returns_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing"));
        assert!(registry.cancel_run("missing").is_none());
    }

    #[test]
    fn unregister_does_not_invoke() {
        let registry = CancellationRegistry::new();
        let (count, handle) = counter();
        registry.register("req-1", handle);

        assert!(registry.unregister("req-1"));
        assert!(!registry.unregister("req-1"));
        assert!(!registry.cancel("req-1"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handle_may_reenter_the_registry() {
        let registry = Arc::new(CancellationRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register("outer", move || {
            // Runs outside the registry lock, so this must not deadlock.
            inner.unregister("outer");
            inner.register("follow-up", || {});
        });

        assert!(registry.cancel("outer"));
        assert!(registry.contains("follow-up"));
    }

    #[test]
    fn cancel_scope_matches_conversation_and_workspace() {
        let registry = CancellationRegistry::new();
        let key = ConversationKey::new("u", "g", "t");
        let other = ConversationKey::new("u", "g", "t2");
        let (count, handle) = counter();

        registry.register_run(
            "a",
            RunScope {
                conversation: key.clone(),
                workspace: "ws".to_string(),
            },
            CancellationToken::new(),
            handle,
        );
        registry.register_run(
            "b",
            RunScope {
                conversation: other,
                workspace: "ws".to_string(),
            },
            CancellationToken::new(),
            || {},
        );
        registry.register_run(
            "c",
            RunScope {
                conversation: key.clone(),
                workspace: "other-ws".to_string(),
            },
            CancellationToken::new(),
            || {},
        );

        let cancelled = registry.cancel_scope(&key, "ws");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].0, "a");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.contains("b"));
        assert!(registry.contains("c"));
    }

    #[test]
    fn plain_registration_reports_already_closed() {
        let registry = CancellationRegistry::new();
        registry.register("req", || {});
        let closed = registry.cancel_run("req").unwrap();
        assert!(closed.is_cancelled());
    }

    #[test]
    fn list_reports_registered_entries() {
        let registry = CancellationRegistry::new();
        registry.register("one", || {});
        registry.register("two", || {});

        let mut ids: Vec<String> = registry.list().into_iter().map(|e| e.request_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["one".to_string(), "two".to_string()]);

        let json = serde_json::to_value(&registry.list()[0]).unwrap();
        assert!(json.get("requestId").is_some());
        assert!(json.get("registeredAt").is_some());
    }
}
