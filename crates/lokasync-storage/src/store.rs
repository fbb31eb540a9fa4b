//! Session store abstraction.
//!
//! Every backend addresses records by the full [`CompositeKey`]. The core
//! collaborator operations (`find_one`, `update_fields`, `insert`) are kept
//! for callers that need them, but the ingest pipeline goes through
//! [`SessionStore::upsert`], which each backend runs as one atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lokasync_core::{CompositeKey, FieldSet, FlashStatus, UpdateSession};

use crate::error::Result;

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// The record as stored after the write.
    pub session: UpdateSession,
    /// Whether the record was created by this call.
    pub created: bool,
}

/// Exact-match filter for session queries. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    pub node_location: Option<String>,
    pub node_type: Option<String>,
    pub flash_status: Option<FlashStatus>,
    pub node_codename: Option<String>,
    pub session_id: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, session: &UpdateSession) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }

        eq(&self.node_location, &session.key.node_location)
            && eq(&self.node_type, &session.key.node_type)
            && eq(&self.node_codename, &session.key.node_codename)
            && eq(&self.session_id, &session.key.session_id)
            && self.flash_status.map_or(true, |s| s == session.flash_status)
    }
}

/// Distinct values available for filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub node_locations: Vec<String>,
    pub node_types: Vec<String>,
    pub flash_statuses: Vec<FlashStatus>,
}

impl FilterOptions {
    /// Collect sorted, de-duplicated options from `sessions`.
    pub fn collect<'a>(sessions: impl IntoIterator<Item = &'a UpdateSession>) -> Self {
        let mut node_locations = Vec::new();
        let mut node_types = Vec::new();
        for session in sessions {
            node_locations.push(session.key.node_location.clone());
            node_types.push(session.key.node_type.clone());
        }
        node_locations.sort();
        node_locations.dedup();
        node_types.sort();
        node_types.dedup();

        Self {
            node_locations,
            node_types,
            flash_statuses: FlashStatus::ALL.to_vec(),
        }
    }
}

/// Persistent home of update sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a record by its full composite key.
    async fn find_one(&self, key: &CompositeKey) -> Result<Option<UpdateSession>>;

    /// Set `fields` on the record at `key`. Returns `false` when no record
    /// exists.
    async fn update_fields(&self, key: &CompositeKey, fields: &FieldSet) -> Result<bool>;

    /// Insert a new record. Fails with `Conflict` if the key is taken.
    async fn insert(&self, session: UpdateSession) -> Result<UpdateSession>;

    /// Find-or-create the record at `key` and apply `fields`, atomically with
    /// respect to other writers of the same key.
    async fn upsert(
        &self,
        key: &CompositeKey,
        fields: &FieldSet,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Matching records, newest first.
    async fn list(&self, filter: &LogFilter, skip: usize, limit: usize)
        -> Result<Vec<UpdateSession>>;

    async fn count(&self, filter: &LogFilter) -> Result<usize>;

    /// First record carrying `session_id`.
    async fn get_by_session_id(&self, session_id: &str) -> Result<Option<UpdateSession>>;

    /// Delete one record carrying `session_id`, returning how many were removed.
    async fn delete_by_session_id(&self, session_id: &str) -> Result<usize>;

    async fn filter_options(&self) -> Result<FilterOptions>;
}

/// Apply `fields` to `existing`, or build a new session when there is none.
pub(crate) fn merge_or_create(
    existing: Option<UpdateSession>,
    key: &CompositeKey,
    fields: &FieldSet,
    now: DateTime<Utc>,
) -> UpsertOutcome {
    match existing {
        Some(mut session) => {
            session.apply(fields);
            UpsertOutcome {
                session,
                created: false,
            }
        }
        None => UpsertOutcome {
            session: UpdateSession::new(key.clone(), fields, now),
            created: true,
        },
    }
}

/// Filter, order newest first and paginate.
pub(crate) fn select_page(
    sessions: impl IntoIterator<Item = UpdateSession>,
    filter: &LogFilter,
    skip: usize,
    limit: usize,
) -> Vec<UpdateSession> {
    let mut matched: Vec<UpdateSession> =
        sessions.into_iter().filter(|s| filter.matches(s)).collect();
    matched.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    matched.into_iter().skip(skip).take(limit).collect()
}

/// Among records carrying `session_id`, the one returned by lookups.
pub(crate) fn first_by_session_id(
    sessions: impl IntoIterator<Item = UpdateSession>,
    session_id: &str,
) -> Option<UpdateSession> {
    sessions
        .into_iter()
        .filter(|s| s.key.session_id == session_id)
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(location: &str, node_type: &str, created_at: DateTime<Utc>) -> UpdateSession {
        let key = CompositeKey {
            session_id: format!("s-{}-{}", location, created_at.timestamp()),
            node_mac: "AA:BB:CC:DD:EE:FF".to_string(),
            node_location: location.to_string(),
            node_type: node_type.to_string(),
            node_id: "1".to_string(),
            node_codename: format!("{}_{}_1", location, node_type),
            firmware_version: "1.0.0".to_string(),
        };
        UpdateSession::new(key, &FieldSet::default(), created_at)
    }

    #[test]
    fn test_filter_matches() {
        let s = session("Cibubur", "Pembibitan", Utc::now());

        assert!(LogFilter::default().matches(&s));
        assert!(LogFilter {
            node_location: Some("Cibubur".to_string()),
            flash_status: Some(FlashStatus::InProgress),
            ..Default::default()
        }
        .matches(&s));
        assert!(!LogFilter {
            node_type: Some("Penyemaian".to_string()),
            ..Default::default()
        }
        .matches(&s));
        assert!(!LogFilter {
            flash_status: Some(FlashStatus::Success),
            ..Default::default()
        }
        .matches(&s));
    }

    #[test]
    fn test_select_page_orders_newest_first() {
        let now = Utc::now();
        let sessions = vec![
            session("A", "x", now - Duration::seconds(20)),
            session("B", "x", now),
            session("C", "x", now - Duration::seconds(10)),
        ];

        let page = select_page(sessions.clone(), &LogFilter::default(), 0, 10);
        let locations: Vec<_> = page.iter().map(|s| s.key.node_location.as_str()).collect();
        assert_eq!(locations, vec!["B", "C", "A"]);

        let page = select_page(sessions, &LogFilter::default(), 1, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key.node_location, "C");
    }

    #[test]
    fn test_filter_options_distinct_sorted() {
        let now = Utc::now();
        let sessions = vec![
            session("Depok", "Penyemaian", now),
            session("Bogor", "Pembibitan", now),
            session("Depok", "Pembibitan", now),
        ];

        let options = FilterOptions::collect(&sessions);
        assert_eq!(options.node_locations, vec!["Bogor", "Depok"]);
        assert_eq!(options.node_types, vec!["Pembibitan", "Penyemaian"]);
        assert_eq!(options.flash_statuses.len(), 3);
    }

    #[test]
    fn test_merge_or_create() {
        let now = Utc::now();
        let base = session("A", "x", now);
        let fields = FieldSet {
            bytes_written: Some(512),
            ..Default::default()
        };

        let created = merge_or_create(None, &base.key, &fields, now);
        assert!(created.created);
        assert_eq!(created.session.bytes_written, Some(512));

        let updated = merge_or_create(Some(base.clone()), &base.key, &fields, now);
        assert!(!updated.created);
        assert_eq!(updated.session.id, base.id);
        assert_eq!(updated.session.bytes_written, Some(512));
    }
}
