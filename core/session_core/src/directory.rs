//! Session directory
//!
//! Bounded map from session key to the live `FlowSession`. Every structural operation
//! takes the one table-wide lock for the duration of the map operation only; callers
//! receive `Arc` handles and do their I/O after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use mio::Token;
use parking_lot::Mutex;

use crate::session::{FlowSession, SessionKey};

// ============================================================================
// Insert Outcome
// ============================================================================

/// Result of a bounded insert
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    /// The key is already live; the existing session is returned
    Duplicate(Arc<FlowSession>),
    /// The directory is at capacity
    Full,
}

// ============================================================================
// Directory Structure
// ============================================================================

/// Live sessions, keyed by `SessionKey`
pub struct SessionDirectory {
    sessions: Mutex<HashMap<SessionKey, Arc<FlowSession>>>,
    capacity: usize,
}

impl SessionDirectory {
    pub fn new(capacity: usize) -> Self {
        SessionDirectory {
            sessions: Mutex::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert unless the key is live or the directory is full, in one critical section
    pub fn try_insert(&self, session: Arc<FlowSession>) -> InsertOutcome {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(session.key()) {
            return InsertOutcome::Duplicate(Arc::clone(existing));
        }
        if sessions.len() >= self.capacity {
            return InsertOutcome::Full;
        }
        sessions.insert(session.key().clone(), session);
        InsertOutcome::Inserted
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<FlowSession>> {
        self.sessions.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<FlowSession>> {
        self.sessions.lock().remove(key)
    }

    /// Remove `session` only if it is the entry currently held under its key
    pub fn remove_exact(&self, session: &FlowSession) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.key()) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), session) => {
                sessions.remove(session.key());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the live sessions
    pub fn values(&self) -> Vec<Arc<FlowSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Linear scan by reactor token (bounded by the capacity)
    pub fn find_by_token(&self, token: Token) -> Option<Arc<FlowSession>> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.token() == token)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn session(port: u16, token: usize) -> Arc<FlowSession> {
        Arc::new(FlowSession::new_udp(
            "8.8.8.8:53".parse().unwrap(),
            format!("10.0.0.2:{}", port).parse().unwrap(),
            Token(token),
            &SessionConfig::default(),
        ))
    }

    #[test]
    fn test_try_insert_and_get() {
        let dir = SessionDirectory::new(4);
        let s = session(1000, 1);
        assert!(matches!(dir.try_insert(Arc::clone(&s)), InsertOutcome::Inserted));
        assert_eq!(dir.len(), 1);
        assert!(Arc::ptr_eq(&dir.get(s.key()).unwrap(), &s));
    }

    #[test]
    fn test_duplicate_key_returns_existing() {
        let dir = SessionDirectory::new(4);
        let first = session(1000, 1);
        let second = session(1000, 2);
        dir.try_insert(Arc::clone(&first));

        match dir.try_insert(second) {
            InsertOutcome::Duplicate(existing) => assert!(Arc::ptr_eq(&existing, &first)),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_capacity_rejects_new() {
        let dir = SessionDirectory::new(2);
        dir.try_insert(session(1, 1));
        dir.try_insert(session(2, 2));
        assert!(matches!(dir.try_insert(session(3, 3)), InsertOutcome::Full));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_remove_and_find_by_token() {
        let dir = SessionDirectory::new(4);
        let s = session(1000, 9);
        dir.try_insert(Arc::clone(&s));

        assert!(dir.find_by_token(Token(9)).is_some());
        assert!(dir.find_by_token(Token(10)).is_none());

        assert!(dir.remove(s.key()).is_some());
        assert!(dir.is_empty());
        assert!(dir.remove(s.key()).is_none());
    }

    #[test]
    fn test_remove_exact_ignores_replacement() {
        let dir = SessionDirectory::new(4);
        let old = session(1000, 1);
        let new = session(1000, 2);
        dir.try_insert(Arc::clone(&new));

        assert!(!dir.remove_exact(&old));
        assert_eq!(dir.len(), 1);
        assert!(dir.remove_exact(&new));
        assert!(dir.is_empty());
    }
}
