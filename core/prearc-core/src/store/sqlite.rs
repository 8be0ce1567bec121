//! SQLite-backed session records.
//!
//! Two tables: `sessions` (live records, keyed by project/timestamp/folder)
//! and `tombstones` (policy fields of deleted records). A connection is
//! opened per call, like the rest of our single-file stores. Writes take the
//! write lock up front (`BEGIN IMMEDIATE`) so concurrent writers queue on the
//! busy timeout instead of failing mid-transaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Params, Row, Transaction, TransactionBehavior,
};

use crate::error::{PrearcError, Result};
use crate::status::PrearcStatus;
use crate::types::{is_unassigned, PolicyFields, PrearchiveCode, SessionRecord, Triple, UNASSIGNED};

use super::SessionStore;

const RECORD_COLUMNS: &str = "project, timestamp, folder, status, source, auto_archive, \
     prevent_anon, prevent_auto_commit, tag, subject, last_modified, version";

pub struct SqliteSessionStore {
    path: PathBuf,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let store = SqliteSessionStore {
            path: path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    project TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    folder TEXT NOT NULL,
                    status TEXT NOT NULL,
                    source TEXT,
                    auto_archive INTEGER,
                    prevent_anon INTEGER NOT NULL DEFAULT 0,
                    prevent_auto_commit INTEGER NOT NULL DEFAULT 0,
                    tag TEXT,
                    subject TEXT,
                    last_modified TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (project, timestamp, folder)
                 );
                 CREATE TABLE IF NOT EXISTS tombstones (
                    project TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    folder TEXT NOT NULL,
                    source TEXT,
                    auto_archive INTEGER,
                    prevent_anon INTEGER NOT NULL DEFAULT 0,
                    prevent_auto_commit INTEGER NOT NULL DEFAULT 0,
                    deleted_at TEXT NOT NULL,
                    PRIMARY KEY (project, timestamp, folder)
                 );
                 COMMIT;",
            )
            .map_err(|e| PrearcError::db("initializing schema", e))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open_connection()?;
        op(&mut conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PrearcError::io(format!("creating {}", parent.display()), e))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|e| PrearcError::db("opening record database", e))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PrearcError::db("enabling WAL", e))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| PrearcError::db("setting busy_timeout", e))?;
        Ok(conn)
    }
}

fn fetch(tx: &Connection, triple: &Triple) -> Result<Option<SessionRecord>> {
    tx.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM sessions WHERE project = ?1 AND timestamp = ?2 AND folder = ?3"
        ),
        params![triple.project_key(), triple.timestamp, triple.folder],
        row_to_record,
    )
    .optional()
    .map_err(|e| PrearcError::db(format!("reading record {triple}"), e))
}

fn write_tombstone(conn: &Connection, triple: &Triple, policy: &PolicyFields) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tombstones
         (project, timestamp, folder, source, auto_archive, prevent_anon, prevent_auto_commit, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            triple.project_key(),
            triple.timestamp,
            triple.folder,
            policy.source,
            policy.auto_archive.map(PrearchiveCode::code),
            policy.prevent_anon,
            policy.prevent_auto_commit,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| PrearcError::db(format!("writing tombstone {triple}"), e))?;
    Ok(())
}

fn take_tombstone(tx: &Transaction<'_>, triple: &Triple) -> Result<Option<PolicyFields>> {
    let policy = tx
        .query_row(
            "SELECT source, auto_archive, prevent_anon, prevent_auto_commit FROM tombstones
             WHERE project = ?1 AND timestamp = ?2 AND folder = ?3",
            params![triple.project_key(), triple.timestamp, triple.folder],
            |row| {
                Ok(PolicyFields {
                    source: row.get(0)?,
                    auto_archive: code_column(row, 1)?,
                    prevent_anon: row.get(2)?,
                    prevent_auto_commit: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| PrearcError::db(format!("reading tombstone {triple}"), e))?;

    if policy.is_some() {
        tx.execute(
            "DELETE FROM tombstones WHERE project = ?1 AND timestamp = ?2 AND folder = ?3",
            params![triple.project_key(), triple.timestamp, triple.folder],
        )
        .map_err(|e| PrearcError::db(format!("clearing tombstone {triple}"), e))?;
    }
    Ok(policy)
}

fn write_record(tx: &Connection, record: &SessionRecord) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO sessions ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            record.triple.project_key(),
            record.triple.timestamp,
            record.triple.folder,
            record.status.as_str(),
            record.source,
            record.auto_archive.map(PrearchiveCode::code),
            record.prevent_anon,
            record.prevent_auto_commit,
            record.tag,
            record.subject,
            record.last_modified.to_rfc3339(),
            record.version as i64,
        ],
    )
    .map_err(|e| PrearcError::db(format!("writing record {}", record.triple), e))?;
    Ok(())
}

fn code_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<PrearchiveCode>> {
    let raw: Option<i32> = row.get(idx)?;
    Ok(raw.and_then(PrearchiveCode::from_code))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let project: String = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let folder: String = row.get(2)?;
    let status: String = row.get(3)?;
    let last_modified: String = row.get(10)?;
    let version: i64 = row.get(11)?;

    let status = status
        .parse::<PrearcStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let last_modified = DateTime::parse_from_rfc3339(&last_modified)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(SessionRecord {
        triple: Triple::new(Some(&project), &timestamp, &folder),
        status,
        source: row.get(4)?,
        auto_archive: code_column(row, 5)?,
        prevent_anon: row.get(6)?,
        prevent_auto_commit: row.get(7)?,
        tag: row.get(8)?,
        subject: row.get(9)?,
        last_modified,
        version: version.max(0) as u64,
    })
}

fn query_records(conn: &Connection, sql: &str, args: impl Params) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| PrearcError::db("preparing record query", e))?;
    let rows = stmt
        .query_map(args, row_to_record)
        .map_err(|e| PrearcError::db("querying records", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| PrearcError::db("reading record rows", e))
}

impl SessionStore for SqliteSessionStore {
    fn get(&self, triple: &Triple) -> Result<Option<SessionRecord>> {
        self.with_connection(|conn| fetch(conn, triple))
    }

    fn insert(&self, mut record: SessionRecord) -> Result<SessionRecord> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| PrearcError::db("starting insert", e))?;

            let previous_version = match fetch(&tx, &record.triple)? {
                Some(existing) => {
                    record.carry_over(&existing.policy());
                    existing.version
                }
                None => {
                    if let Some(policy) = take_tombstone(&tx, &record.triple)? {
                        record.carry_over(&policy);
                    }
                    0
                }
            };
            record.version = previous_version + 1;
            record.last_modified = Utc::now();
            write_record(&tx, &record)?;

            tx.commit().map_err(|e| PrearcError::db("committing insert", e))?;
            Ok(record)
        })
    }

    fn update(&self, record: &SessionRecord) -> Result<SessionRecord> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| PrearcError::db("starting update", e))?;

            let found = match fetch(&tx, &record.triple)? {
                Some(existing) => existing.version,
                None => return Err(PrearcError::SessionNotFound(record.triple.clone())),
            };
            if found != record.version {
                return Err(PrearcError::StaleRecord {
                    triple: record.triple.clone(),
                    expected: record.version,
                    found,
                });
            }

            let mut updated = record.clone();
            updated.version = found + 1;
            updated.last_modified = Utc::now();
            write_record(&tx, &updated)?;

            tx.commit().map_err(|e| PrearcError::db("committing update", e))?;
            Ok(updated)
        })
    }

    fn delete(&self, triple: &Triple) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| PrearcError::db("starting delete", e))?;
            let Some(existing) = fetch(&tx, triple)? else {
                return Ok(false);
            };

            tx.execute(
                "DELETE FROM sessions WHERE project = ?1 AND timestamp = ?2 AND folder = ?3",
                params![triple.project_key(), triple.timestamp, triple.folder],
            )
            .map_err(|e| PrearcError::db(format!("deleting record {triple}"), e))?;

            write_tombstone(&tx, triple, &existing.policy())?;

            tx.commit().map_err(|e| PrearcError::db("committing delete", e))?;
            Ok(true)
        })
    }

    fn bury(&self, triple: &Triple, policy: &PolicyFields) -> Result<()> {
        self.with_connection(|conn| write_tombstone(conn, triple, policy))
    }

    fn delete_cached_row(&self, triple: &Triple) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM sessions WHERE project = ?1 AND timestamp = ?2 AND folder = ?3",
                    params![triple.project_key(), triple.timestamp, triple.folder],
                )
                .map_err(|e| PrearcError::db(format!("purging record {triple}"), e))?;
            Ok(removed > 0)
        })
    }

    fn list_by_project(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        let key = match project {
            Some(p) if !is_unassigned(Some(p)) => p.trim().to_string(),
            _ => UNASSIGNED.to_string(),
        };
        self.with_connection(|conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM sessions WHERE project = ?1
                     ORDER BY timestamp, folder"
                ),
                params![key],
            )
        })
    }

    fn list_all(&self) -> Result<Vec<SessionRecord>> {
        self.with_connection(|conn| {
            query_records(
                conn,
                &format!("SELECT {RECORD_COLUMNS} FROM sessions ORDER BY project, timestamp, folder"),
                [],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn sqlite_store_honours_the_contract() {
        let temp = tempdir().unwrap();
        let counter = AtomicUsize::new(0);
        super::super::contract::run_all(|| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let path = temp.path().join(format!("records-{n}.db"));
            Box::new(SqliteSessionStore::open(&path).unwrap())
        });
    }

    #[test]
    fn records_survive_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("records.db");
        let triple = Triple::new(Some("ALPHA"), "20240102_030405", "S1");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            let mut record = SessionRecord::new(triple.clone(), PrearcStatus::InProcessBuilding);
            record.auto_archive = Some(PrearchiveCode::AutoArchive);
            record.subject = Some("SUBJ01".to_string());
            store.insert(record).unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        let record = store.get(&triple).unwrap().unwrap();
        assert_eq!(record.status, PrearcStatus::InProcessBuilding);
        assert_eq!(record.auto_archive, Some(PrearchiveCode::AutoArchive));
        assert_eq!(record.subject.as_deref(), Some("SUBJ01"));
        assert_eq!(record.version, 1);
    }
}
