//! In-memory session store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use lokasync_core::{CompositeKey, FieldSet, UpdateSession};

use crate::error::{Error, Result};
use crate::store::{
    first_by_session_id, merge_or_create, select_page, FilterOptions, LogFilter, SessionStore,
    UpsertOutcome,
};

/// [`SessionStore`] held in a map behind one mutex. Nothing survives the
/// process; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<CompositeKey, UpdateSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<UpdateSession> {
        self.sessions.lock().values().cloned().collect()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_one(&self, key: &CompositeKey) -> Result<Option<UpdateSession>> {
        Ok(self.sessions.lock().get(key).cloned())
    }

    async fn update_fields(&self, key: &CompositeKey, fields: &FieldSet) -> Result<bool> {
        match self.sessions.lock().get_mut(key) {
            Some(session) => {
                session.apply(fields);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert(&self, session: UpdateSession) -> Result<UpdateSession> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.key) {
            return Err(Error::Conflict(format!(
                "session already exists for {}",
                session.key
            )));
        }
        sessions.insert(session.key.clone(), session.clone());
        Ok(session)
    }

    async fn upsert(
        &self,
        key: &CompositeKey,
        fields: &FieldSet,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut sessions = self.sessions.lock();
        let outcome = merge_or_create(sessions.get(key).cloned(), key, fields, now);
        sessions.insert(key.clone(), outcome.session.clone());
        Ok(outcome)
    }

    async fn list(
        &self,
        filter: &LogFilter,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<UpdateSession>> {
        Ok(select_page(self.snapshot(), filter, skip, limit))
    }

    async fn count(&self, filter: &LogFilter) -> Result<usize> {
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| filter.matches(s))
            .count())
    }

    async fn get_by_session_id(&self, session_id: &str) -> Result<Option<UpdateSession>> {
        Ok(first_by_session_id(self.snapshot(), session_id))
    }

    async fn delete_by_session_id(&self, session_id: &str) -> Result<usize> {
        let mut sessions = self.sessions.lock();
        let victim = first_by_session_id(sessions.values().cloned(), session_id);
        Ok(victim
            .and_then(|s| sessions.remove(&s.key))
            .map_or(0, |_| 1))
    }

    async fn filter_options(&self) -> Result<FilterOptions> {
        Ok(FilterOptions::collect(self.sessions.lock().values()))
    }
}
