//! Conversation scopes
//!
//! A scope is the unit at which rate limits, reply cooldowns, and memory
//! are tracked: a chat (group) id, optionally narrowed to a single user.
//! Scope state is created lazily on first touch and lives for the
//! process; every piece of per-scope mutable state sits behind its own
//! lock so unrelated scopes never contend.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a conversation scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId {
    chat: String,
    user: Option<String>,
}

impl ScopeId {
    /// Scope covering a whole chat or group.
    pub fn chat(chat: impl Into<String>) -> Self {
        Self {
            chat: chat.into(),
            user: None,
        }
    }

    /// Scope narrowed to one user inside a chat.
    pub fn user_in_chat(chat: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            chat: chat.into(),
            user: Some(user.into()),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Stable string key, `chat` or `chat:user`.
    pub fn storage_key(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}", self.chat, user),
            None => self.chat.clone(),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Lazily-populated map of per-scope state.
///
/// `entry` hands out an `Arc<Mutex<T>>` per scope; callers lock only the
/// scope they are working on. Multiple independent maps can coexist,
/// which keeps tests hermetic.
pub struct ScopeMap<T> {
    inner: RwLock<HashMap<ScopeId, Arc<Mutex<T>>>>,
}

impl<T: Default> ScopeMap<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Handle to the scope's state, created on first touch.
    pub fn entry(&self, scope: &ScopeId) -> Arc<Mutex<T>> {
        if let Some(existing) = self.inner.read().get(scope) {
            return Arc::clone(existing);
        }
        let mut map = self.inner.write();
        Arc::clone(
            map.entry(scope.clone())
                .or_insert_with(|| Arc::new(Mutex::new(T::default()))),
        )
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn contains(&self, scope: &ScopeId) -> bool {
        self.inner.read().contains_key(scope)
    }
}

impl<T: Default> Default for ScopeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_formats() {
        assert_eq!(ScopeId::chat("g1").storage_key(), "g1");
        assert_eq!(ScopeId::user_in_chat("g1", "u9").storage_key(), "g1:u9");
    }

    #[test]
    fn entry_creates_on_first_touch() {
        let map: ScopeMap<u32> = ScopeMap::new();
        let scope = ScopeId::chat("g1");
        assert!(!map.contains(&scope));

        *map.entry(&scope).lock() += 3;
        assert!(map.contains(&scope));
        assert_eq!(*map.entry(&scope).lock(), 3);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn scopes_are_independent() {
        let map: ScopeMap<u32> = ScopeMap::new();
        *map.entry(&ScopeId::chat("a")).lock() = 1;
        *map.entry(&ScopeId::chat("b")).lock() = 2;

        assert_eq!(*map.entry(&ScopeId::chat("a")).lock(), 1);
        assert_eq!(*map.entry(&ScopeId::chat("b")).lock(), 2);
    }

    #[test]
    fn user_scope_distinct_from_chat_scope() {
        let map: ScopeMap<u32> = ScopeMap::new();
        *map.entry(&ScopeId::chat("g")).lock() = 1;
        assert_eq!(*map.entry(&ScopeId::user_in_chat("g", "u")).lock(), 0);
    }
}
