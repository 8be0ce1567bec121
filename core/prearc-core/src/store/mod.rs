//! Session record persistence.
//!
//! One live record per [`Triple`]. Deleting a record leaves a tombstone with
//! its policy fields so the next arrival under the same triple inherits them.
//! Purging the cached row skips the tombstone.
//!
//! Writes are versioned: `insert` and `update` bump `version`, and `update`
//! only succeeds if the caller's copy carries the stored version.

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use crate::error::Result;
use crate::types::{PolicyFields, SessionRecord, Triple};

pub trait SessionStore: Send + Sync {
    fn get(&self, triple: &Triple) -> Result<Option<SessionRecord>>;

    /// Registers a record. An existing live record is replaced (policy fields
    /// it set are kept where the incoming record leaves them unset); a
    /// tombstone contributes its policy fields the same way and is consumed.
    fn insert(&self, record: SessionRecord) -> Result<SessionRecord>;

    /// Compare-and-swap on `record.version`.
    fn update(&self, record: &SessionRecord) -> Result<SessionRecord>;

    /// Soft delete: removes the live record and keeps its policy fields.
    fn delete(&self, triple: &Triple) -> Result<bool>;

    /// Stores `policy` as the tombstone for `triple`, replacing any earlier
    /// one. A live record, if any, is left alone.
    fn bury(&self, triple: &Triple, policy: &PolicyFields) -> Result<()>;

    /// Removes the live record without leaving a tombstone.
    fn delete_cached_row(&self, triple: &Triple) -> Result<bool>;

    /// Records for one project; `None` lists unassigned sessions.
    fn list_by_project(&self, project: Option<&str>) -> Result<Vec<SessionRecord>>;

    fn list_all(&self) -> Result<Vec<SessionRecord>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store must share; each backend runs these.

    use super::SessionStore;
    use crate::error::PrearcError;
    use crate::status::PrearcStatus;
    use crate::types::{PolicyFields, PrearchiveCode, SessionRecord, Triple};

    fn triple(folder: &str) -> Triple {
        Triple::new(Some("ALPHA"), "20240102_030405", folder)
    }

    pub fn insert_then_get(store: &dyn SessionStore) {
        let mut record = SessionRecord::new(triple("S1"), PrearcStatus::Receiving);
        record.tag = Some("1.2.840.1".to_string());
        let stored = store.insert(record).unwrap();
        assert_eq!(stored.version, 1);

        let fetched = store.get(&triple("S1")).unwrap().unwrap();
        assert_eq!(fetched.status, PrearcStatus::Receiving);
        assert_eq!(fetched.tag.as_deref(), Some("1.2.840.1"));
        assert!(store.get(&triple("S2")).unwrap().is_none());
    }

    pub fn second_insert_updates(store: &dyn SessionStore) {
        let mut first = SessionRecord::new(triple("S1"), PrearcStatus::Receiving);
        first.auto_archive = Some(PrearchiveCode::AutoArchive);
        store.insert(first).unwrap();
        store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Ready))
            .unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PrearcStatus::Ready);
        assert_eq!(all[0].auto_archive, Some(PrearchiveCode::AutoArchive));
        assert_eq!(all[0].version, 2);
    }

    pub fn stale_update_is_rejected(store: &dyn SessionStore) {
        let stored = store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Ready))
            .unwrap();

        let mut winner = stored.clone();
        winner.status = PrearcStatus::InProcessArchiving;
        let winner = store.update(&winner).unwrap();
        assert_eq!(winner.version, stored.version + 1);

        let mut loser = stored;
        loser.status = PrearcStatus::InProcessDeleting;
        let err = store.update(&loser).unwrap_err();
        assert!(matches!(err, PrearcError::StaleRecord { .. }), "{err}");
        assert_eq!(
            store.get(&triple("S1")).unwrap().unwrap().status,
            PrearcStatus::InProcessArchiving
        );
    }

    pub fn update_missing_is_not_found(store: &dyn SessionStore) {
        let record = SessionRecord::new(triple("S9"), PrearcStatus::Ready);
        assert!(store.update(&record).unwrap_err().is_not_found());
    }

    pub fn delete_preserves_policy_for_next_arrival(store: &dyn SessionStore) {
        let mut record = SessionRecord::new(triple("S1"), PrearcStatus::Ready);
        record.auto_archive = Some(PrearchiveCode::AutoArchiveOverwrite);
        record.prevent_anon = true;
        record.prevent_auto_commit = true;
        record.source = Some("DICOM-SCP-1".to_string());
        store.insert(record).unwrap();

        assert!(store.delete(&triple("S1")).unwrap());
        assert!(store.get(&triple("S1")).unwrap().is_none());

        let again = store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Receiving))
            .unwrap();
        assert_eq!(again.auto_archive, Some(PrearchiveCode::AutoArchiveOverwrite));
        assert!(again.prevent_anon);
        assert!(again.prevent_auto_commit);
        assert_eq!(again.source.as_deref(), Some("DICOM-SCP-1"));

        // The tombstone is consumed by the re-arrival.
        store.delete_cached_row(&triple("S1")).unwrap();
        let third = store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Receiving))
            .unwrap();
        assert_eq!(third.auto_archive, None);
    }

    pub fn purge_leaves_no_tombstone(store: &dyn SessionStore) {
        let mut record = SessionRecord::new(triple("S1"), PrearcStatus::Ready);
        record.prevent_anon = true;
        store.insert(record).unwrap();

        assert!(store.delete_cached_row(&triple("S1")).unwrap());
        assert!(!store.delete_cached_row(&triple("S1")).unwrap());
        let again = store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Receiving))
            .unwrap();
        assert!(!again.prevent_anon);
    }

    pub fn buried_policy_reaches_next_arrival(store: &dyn SessionStore) {
        let policy = PolicyFields {
            auto_archive: Some(PrearchiveCode::AutoArchive),
            prevent_anon: true,
            prevent_auto_commit: false,
            source: Some("DICOM-SCP-2".to_string()),
        };
        store.bury(&triple("S1"), &policy).unwrap();
        assert!(store.get(&triple("S1")).unwrap().is_none());

        let arrived = store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Receiving))
            .unwrap();
        assert_eq!(arrived.policy(), policy);
    }

    pub fn list_by_project_filters(store: &dyn SessionStore) {
        store
            .insert(SessionRecord::new(triple("S1"), PrearcStatus::Ready))
            .unwrap();
        store
            .insert(SessionRecord::new(
                Triple::new(Some("BETA"), "20240102_030405", "S1"),
                PrearcStatus::Ready,
            ))
            .unwrap();
        store
            .insert(SessionRecord::new(
                Triple::new(None, "20240102_030405", "S1"),
                PrearcStatus::Receiving,
            ))
            .unwrap();

        assert_eq!(store.list_by_project(Some("ALPHA")).unwrap().len(), 1);
        let unassigned = store.list_by_project(None).unwrap();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].triple.project, None);
        assert_eq!(store.list_all().unwrap().len(), 3);
    }

    pub fn run_all(make: impl Fn() -> Box<dyn SessionStore>) {
        insert_then_get(make().as_ref());
        second_insert_updates(make().as_ref());
        stale_update_is_rejected(make().as_ref());
        update_missing_is_not_found(make().as_ref());
        delete_preserves_policy_for_next_arrival(make().as_ref());
        purge_leaves_no_tombstone(make().as_ref());
        buried_policy_reaches_next_arrival(make().as_ref());
        list_by_project_filters(make().as_ref());
    }
}
