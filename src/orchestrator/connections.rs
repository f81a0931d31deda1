use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Session;

/// Bounded registry of live sessions; membership is what admission control counts
pub struct ConnectionSet {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    capacity: usize,
}

impl ConnectionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register `session` unless the set is full
    ///
    /// The returned guard removes the entry when dropped.
    pub fn admit(self: &Arc<Self>, session: Arc<Session>) -> Option<ConnectionGuard> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.capacity {
            return None;
        }

        let id = session.id();
        sessions.insert(id, session);
        Some(ConnectionGuard {
            set: Arc::clone(self),
            id,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions live at the time of the call
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }
}

pub struct ConnectionGuard {
    set: Arc<ConnectionSet>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.set.sessions.lock().remove(&self.id);
    }
}
