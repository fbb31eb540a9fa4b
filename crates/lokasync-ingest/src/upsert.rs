//! Find-or-create of update sessions by composite key.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use lokasync_core::{targets, CompositeKey, FieldSet};
use lokasync_storage::{SessionStore, UpsertOutcome};

use crate::error::Result;

/// Applies decoded field sets to the session store.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn SessionStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Merge `fields` into the session at `key`, creating it on first sight.
    ///
    /// The store performs lookup and write as one step, so concurrent first
    /// messages for the same key still yield a single record.
    pub async fn upsert(&self, key: &CompositeKey, fields: &FieldSet) -> Result<UpsertOutcome> {
        match self.store.upsert(key, fields, Utc::now()).await {
            Ok(outcome) => {
                info!(
                    target: targets::DB,
                    codename = %key.node_codename,
                    session_id = %key.session_id,
                    created = outcome.created,
                    fields = ?fields.field_names(),
                    "Log processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    target: targets::DB,
                    codename = %key.node_codename,
                    session_id = %key.session_id,
                    error = %e,
                    "Log upsert failed"
                );
                Err(e.into())
            }
        }
    }
}
