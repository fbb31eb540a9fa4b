//! Persistent session store backed by redb.
//!
//! Records are stored as JSON under the length-prefixed encoding of their
//! composite key, so the table itself guarantees one record per identity.
//! All transactions run on the blocking thread pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use lokasync_core::{targets, CompositeKey, FieldSet, UpdateSession};

use crate::error::{Error, Result};
use crate::store::{
    first_by_session_id, merge_or_create, select_page, FilterOptions, LogFilter, SessionStore,
    UpsertOutcome,
};

// Sessions table: key = CompositeKey::storage_key(), value = UpdateSession as JSON
const SESSIONS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("update_sessions");

/// redb-backed [`SessionStore`].
#[derive(Clone)]
pub struct RedbSessionStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbSessionStore {
    /// Open or create the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;

        info!(target: targets::DB, path = %path.display(), "Session store opened");

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn decode(json: &str) -> Result<UpdateSession> {
    Ok(serde_json::from_str(json)?)
}

fn load_all(db: &Database) -> Result<Vec<UpdateSession>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(SESSIONS_TABLE)?;

    let mut sessions = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        sessions.push(decode(value.value())?);
    }
    Ok(sessions)
}

#[async_trait]
impl SessionStore for RedbSessionStore {
    async fn find_one(&self, key: &CompositeKey) -> Result<Option<UpdateSession>> {
        let storage_key = key.storage_key();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let found = table.get(storage_key.as_str())?;
            found.map(|guard| decode(guard.value())).transpose()
        })
        .await
    }

    async fn update_fields(&self, key: &CompositeKey, fields: &FieldSet) -> Result<bool> {
        let storage_key = key.storage_key();
        let fields = fields.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let updated = {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                let existing = table
                    .get(storage_key.as_str())?
                    .map(|guard| decode(guard.value()))
                    .transpose()?;

                match existing {
                    Some(mut session) => {
                        session.apply(&fields);
                        let json = serde_json::to_string(&session)?;
                        table.insert(storage_key.as_str(), json.as_str())?;
                        true
                    }
                    None => false,
                }
            };
            write_txn.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn insert(&self, session: UpdateSession) -> Result<UpdateSession> {
        let storage_key = session.key.storage_key();
        self.blocking(move |db| {
            let json = serde_json::to_string(&session)?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                let taken = table.get(storage_key.as_str())?.is_some();
                if taken {
                    return Err(Error::Conflict(format!(
                        "session already exists for {}",
                        session.key
                    )));
                }
                table.insert(storage_key.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(session)
        })
        .await
    }

    async fn upsert(
        &self,
        key: &CompositeKey,
        fields: &FieldSet,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let key = key.clone();
        let fields = fields.clone();
        self.blocking(move |db| {
            let storage_key = key.storage_key();
            let write_txn = db.begin_write()?;
            let outcome = {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                let existing = table
                    .get(storage_key.as_str())?
                    .map(|guard| decode(guard.value()))
                    .transpose()?;

                let outcome = merge_or_create(existing, &key, &fields, now);
                let json = serde_json::to_string(&outcome.session)?;
                table.insert(storage_key.as_str(), json.as_str())?;
                outcome
            };
            write_txn.commit()?;

            debug!(
                target: targets::DB,
                id = %outcome.session.id,
                created = outcome.created,
                "Session upserted"
            );
            Ok(outcome)
        })
        .await
    }

    async fn list(
        &self,
        filter: &LogFilter,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<UpdateSession>> {
        let filter = filter.clone();
        self.blocking(move |db| Ok(select_page(load_all(db)?, &filter, skip, limit)))
            .await
    }

    async fn count(&self, filter: &LogFilter) -> Result<usize> {
        let filter = filter.clone();
        self.blocking(move |db| {
            Ok(load_all(db)?.iter().filter(|s| filter.matches(s)).count())
        })
        .await
    }

    async fn get_by_session_id(&self, session_id: &str) -> Result<Option<UpdateSession>> {
        let session_id = session_id.to_string();
        self.blocking(move |db| Ok(first_by_session_id(load_all(db)?, &session_id)))
            .await
    }

    async fn delete_by_session_id(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let deleted = {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;

                let mut candidates = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    candidates.push(decode(value.value())?);
                }

                match first_by_session_id(candidates, &session_id) {
                    Some(victim) => {
                        let storage_key = victim.key.storage_key();
                        table.remove(storage_key.as_str())?;
                        1
                    }
                    None => 0,
                }
            };
            write_txn.commit()?;

            if deleted > 0 {
                info!(target: targets::DB, session_id = %session_id, "Session deleted");
            }
            Ok(deleted)
        })
        .await
    }

    async fn filter_options(&self) -> Result<FilterOptions> {
        self.blocking(|db| Ok(FilterOptions::collect(&load_all(db)?)))
            .await
    }
}
