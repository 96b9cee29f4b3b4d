//! The authoritative ordered list of live sessions.

use std::sync::{Arc, Mutex, MutexGuard};

use super::session::TerminalSession;

/// Structural change to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Added(String),
    Removed(String),
}

pub type RegistryListener = Box<dyn Fn(&RegistryChange) + Send + Sync>;

struct RegistryInner {
    /// Order is the user-visible window order: stable except for
    /// explicit insert/remove.
    sessions: Vec<Arc<TerminalSession>>,
    listeners: Vec<RegistryListener>,
}

/// Ordered collection of live [`TerminalSession`]s for one service
/// lifetime, shared by every surface that displays "windows".
///
/// Listeners are notified synchronously, in registration order, while
/// the structural lock is held — mutations serialize against
/// notification dispatch. Listeners must not call back into the
/// registry.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: Vec::new(),
                listeners: Vec::new(),
            }),
        }
    }

    /// Append a session to the window order.
    pub fn add(&self, session: Arc<TerminalSession>) {
        let mut inner = self.lock();
        let handle = session.handle().to_string();
        inner.sessions.push(session);
        notify(&inner, &RegistryChange::Added(handle));
    }

    /// Add a session and wire its exit callback to remove it from this
    /// registry and finish it. Callers that `add` directly must do both
    /// themselves.
    pub fn adopt(self: &Arc<Self>, session: Arc<TerminalSession>) {
        let registry = Arc::clone(self);
        session.set_finish_callback(Some(Box::new(move |exited: &TerminalSession| {
            if let Some(removed) = registry.remove(exited.handle()) {
                removed.finish();
            }
        })));
        self.add(session);
    }

    /// Remove a session from the window order. Does not call `finish`.
    pub fn remove(&self, handle: &str) -> Option<Arc<TerminalSession>> {
        let mut inner = self.lock();
        let index = inner.sessions.iter().position(|s| s.handle() == handle)?;
        let session = inner.sessions.remove(index);
        notify(&inner, &RegistryChange::Removed(handle.to_string()));
        Some(session)
    }

    pub fn get(&self, handle: &str) -> Option<Arc<TerminalSession>> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.handle() == handle)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Snapshot of the sessions in window order.
    pub fn sessions(&self) -> Vec<Arc<TerminalSession>> {
        self.lock().sessions.clone()
    }

    pub fn add_listener(&self, listener: RegistryListener) {
        self.lock().listeners.push(listener);
    }

    /// Finish every session and clear the list. Finish callbacks are
    /// cleared first so session teardown cannot re-enter removal while
    /// we iterate.
    pub fn shutdown(&self) {
        let sessions = self.lock().sessions.clone();
        for session in &sessions {
            session.set_finish_callback(None);
            session.finish();
        }
        let mut inner = self.lock();
        inner.sessions.clear();
        tracing::info!("registry shut down, {} sessions finished", sessions.len());
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn notify(inner: &RegistryInner, change: &RegistryChange) {
    for listener in &inner.listeners {
        listener(change);
    }
}
