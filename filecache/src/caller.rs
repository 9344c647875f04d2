//! Caller identity for downloader election.
//!
//! Every client interacting with a segment is identified by a [`ClientId`],
//! typically a query or request id. The cache obtains the id of the current
//! caller through an injected [`CallerIdSource`]; the default source reads a
//! scoped thread-local installed with [`CallerScope`].

use std::cell::RefCell;
use std::fmt;

/// Identifier of a cache client (typically a query or request id).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ClientId(String);

impl ClientId {
    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the current caller's identity.
///
/// Injected into the cache at construction. Returning `None` means the
/// calling context carries no identity; operations that require one fail
/// with [`CacheError::NoCallerId`](crate::CacheError::NoCallerId).
pub trait CallerIdSource: Send + Sync {
    /// Get the id of the calling client, if any.
    fn caller_id(&self) -> Option<ClientId>;
}

thread_local! {
    static CURRENT_CALLER: RefCell<Option<ClientId>> = const { RefCell::new(None) };
}

/// The default [`CallerIdSource`]: a scoped thread-local id.
///
/// Install an id for the current thread with [`CallerScope::enter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedCallerId;

impl CallerIdSource for ScopedCallerId {
    fn caller_id(&self) -> Option<ClientId> {
        CURRENT_CALLER.with(|current| current.borrow().clone())
    }
}

/// RAII guard installing a caller id for the current thread.
///
/// The previous id (if any) is restored when the scope is dropped, so
/// scopes nest.
///
/// # Example
///
/// ```
/// use filecache::{CallerIdSource, CallerScope, ScopedCallerId};
///
/// let _scope = CallerScope::enter("query-42");
/// assert_eq!(
///     ScopedCallerId.caller_id().map(|id| id.to_string()),
///     Some("query-42".to_owned()),
/// );
/// ```
#[must_use = "the caller id is uninstalled when the scope is dropped"]
pub struct CallerScope {
    previous: Option<ClientId>,
}

impl CallerScope {
    /// Install `id` as the current thread's caller id.
    pub fn enter(id: impl Into<ClientId>) -> Self {
        let previous =
            CURRENT_CALLER.with(|current| current.borrow_mut().replace(id.into()));
        Self { previous }
    }
}

impl Drop for CallerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_CALLER.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_id_outside_scope() {
        assert_eq!(ScopedCallerId.caller_id(), None);
    }

    #[test]
    fn test_scope_installs_and_removes() {
        {
            let _scope = CallerScope::enter("query-1");
            assert_eq!(ScopedCallerId.caller_id(), Some(ClientId::from("query-1")));
        }
        assert_eq!(ScopedCallerId.caller_id(), None);
    }

    #[test]
    fn test_scopes_nest() {
        let _outer = CallerScope::enter("outer");
        {
            let _inner = CallerScope::enter("inner");
            assert_eq!(ScopedCallerId.caller_id(), Some(ClientId::from("inner")));
        }
        assert_eq!(ScopedCallerId.caller_id(), Some(ClientId::from("outer")));
    }

    #[test]
    fn test_ids_are_per_thread() {
        let _scope = CallerScope::enter("main-thread");
        let other = std::thread::spawn(|| ScopedCallerId.caller_id())
            .join()
            .expect("thread panicked");
        assert_eq!(other, None);
    }
}
