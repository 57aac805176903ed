//! Shared storage handle.
//!
//! A [`Store`] owns one storage backend and the validated [`Schema`]. Every
//! session opened from it shares both; the store keeps only weak handles to
//! its sessions so the synchronizer can reach siblings without keeping them
//! alive.

use crate::{Session, SessionConfig, SessionInner};
use entitrack_core::{Schema, Storage};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

pub(crate) struct StoreInner {
    pub(crate) backend: RefCell<Box<dyn Storage>>,
    pub(crate) schema: Schema,
    sessions: RefCell<Vec<Weak<SessionInner>>>,
}

impl StoreInner {
    pub(crate) fn register(&self, session: Weak<SessionInner>) {
        self.sessions.borrow_mut().push(session);
    }

    pub(crate) fn unregister(&self, id: uuid::Uuid) {
        self.sessions
            .borrow_mut()
            .retain(|w| w.upgrade().is_some_and(|s| s.id != id));
    }

    /// Sessions still alive, pruning the dead ones.
    pub(crate) fn live_sessions(&self) -> Vec<Rc<SessionInner>> {
        let mut sessions = self.sessions.borrow_mut();
        sessions.retain(|w| w.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }
}

/// A storage backend shared by any number of sessions.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<StoreInner>,
}

impl Store {
    pub fn new(backend: impl Storage + 'static, schema: Schema) -> Self {
        tracing::debug!(backend = backend.name(), tables = schema.len(), "Store created");
        Self {
            inner: Rc::new(StoreInner {
                backend: RefCell::new(Box::new(backend)),
                schema,
                sessions: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Open a session with the default configuration.
    pub fn open_session(&self) -> Session {
        self.open_session_with(SessionConfig::default())
    }

    pub fn open_session_with(&self, config: SessionConfig) -> Session {
        Session::open(Rc::clone(&self.inner), config)
    }

    /// Number of sessions that are still alive.
    pub fn session_count(&self) -> usize {
        self.inner.live_sessions().len()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend.borrow().name())
            .field("tables", &self.inner.schema.len())
            .field("sessions", &self.inner.sessions.borrow().len())
            .finish()
    }
}
