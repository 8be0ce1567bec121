use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::error::{PrearcError, Result};
use crate::types::{is_unassigned, PolicyFields, SessionRecord, Triple};

use super::SessionStore;

#[derive(Default)]
struct Tables {
    live: HashMap<Triple, SessionRecord>,
    tombstones: HashMap<Triple, PolicyFields>,
}

/// Process-local store. Used by tests and by embedders without a database.
#[derive(Default)]
pub struct MemorySessionStore {
    tables: Mutex<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, triple: &Triple) -> Result<Option<SessionRecord>> {
        Ok(self.tables().live.get(triple).cloned())
    }

    fn insert(&self, mut record: SessionRecord) -> Result<SessionRecord> {
        let mut tables = self.tables();
        let triple = record.triple.clone();

        let previous_version = match tables.live.get(&triple) {
            Some(existing) => {
                record.carry_over(&existing.policy());
                existing.version
            }
            None => {
                if let Some(policy) = tables.tombstones.remove(&triple) {
                    record.carry_over(&policy);
                }
                0
            }
        };

        record.version = previous_version + 1;
        record.last_modified = Utc::now();
        tables.live.insert(triple, record.clone());
        Ok(record)
    }

    fn update(&self, record: &SessionRecord) -> Result<SessionRecord> {
        let mut tables = self.tables();
        let Some(existing) = tables.live.get_mut(&record.triple) else {
            return Err(PrearcError::SessionNotFound(record.triple.clone()));
        };
        if existing.version != record.version {
            return Err(PrearcError::StaleRecord {
                triple: record.triple.clone(),
                expected: record.version,
                found: existing.version,
            });
        }

        let mut updated = record.clone();
        updated.version = existing.version + 1;
        updated.last_modified = Utc::now();
        *existing = updated.clone();
        Ok(updated)
    }

    fn delete(&self, triple: &Triple) -> Result<bool> {
        let mut tables = self.tables();
        match tables.live.remove(triple) {
            Some(record) => {
                tables.tombstones.insert(triple.clone(), record.policy());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn bury(&self, triple: &Triple, policy: &PolicyFields) -> Result<()> {
        self.tables().tombstones.insert(triple.clone(), policy.clone());
        Ok(())
    }

    fn delete_cached_row(&self, triple: &Triple) -> Result<bool> {
        Ok(self.tables().live.remove(triple).is_some())
    }

    fn list_by_project(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        let wanted = if is_unassigned(project) { None } else { project };
        let mut records: Vec<_> = self
            .tables()
            .live
            .values()
            .filter(|r| r.triple.project.as_deref() == wanted)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.triple.cmp(&b.triple));
        Ok(records)
    }

    fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<_> = self.tables().live.values().cloned().collect();
        records.sort_by(|a, b| a.triple.cmp(&b.triple));
        Ok(records)
    }
}
