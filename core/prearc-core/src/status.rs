//! Prearchive status vocabulary.
//!
//! Three families share suffixes:
//!
//! ```text
//! normal       RECEIVING   BUILDING   ARCHIVING   ...  READY  ERROR
//! queued                   QUEUED_BUILDING  QUEUED_ARCHIVING ...
//! in-process  _RECEIVING  _BUILDING  _ARCHIVING   ...
//! ```
//!
//! A normal, non-terminal status maps to its in-process shadow (`_` prefix).
//! Transitions set the shadow before doing real work and settle on `READY`,
//! `ERROR` or record removal afterwards. The mapping is built once into a
//! [`StatusTable`] and handed to whoever needs it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrearcStatus {
    #[serde(rename = "RECEIVING")]
    Receiving,
    #[serde(rename = "RECEIVING_INTERRUPT")]
    ReceivingInterrupt,
    #[serde(rename = "BUILDING")]
    Building,
    #[serde(rename = "ARCHIVING")]
    Archiving,
    #[serde(rename = "MOVING")]
    Moving,
    #[serde(rename = "SEPARATING")]
    Separating,
    #[serde(rename = "DELETING")]
    Deleting,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "ERROR")]
    Error,

    #[serde(rename = "QUEUED_BUILDING")]
    QueuedBuilding,
    #[serde(rename = "QUEUED_ARCHIVING")]
    QueuedArchiving,
    #[serde(rename = "QUEUED_MOVING")]
    QueuedMoving,
    #[serde(rename = "QUEUED_SEPARATING")]
    QueuedSeparating,
    #[serde(rename = "QUEUED_DELETING")]
    QueuedDeleting,

    #[serde(rename = "_RECEIVING")]
    InProcessReceiving,
    #[serde(rename = "_RECEIVING_INTERRUPT")]
    InProcessReceivingInterrupt,
    #[serde(rename = "_BUILDING")]
    InProcessBuilding,
    #[serde(rename = "_ARCHIVING")]
    InProcessArchiving,
    #[serde(rename = "_MOVING")]
    InProcessMoving,
    #[serde(rename = "_SEPARATING")]
    InProcessSeparating,
    #[serde(rename = "_DELETING")]
    InProcessDeleting,
    #[serde(rename = "_CONFLICT")]
    InProcessConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFamily {
    Normal,
    Queued,
    InProcess,
}

/// One row of the status table.
#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub status: PrearcStatus,
    pub name: &'static str,
    pub family: StatusFamily,
    pub interruptable: bool,
}

const fn row(status: PrearcStatus, name: &'static str, family: StatusFamily) -> StatusEntry {
    StatusEntry {
        status,
        name,
        family,
        interruptable: true,
    }
}

use PrearcStatus as S;
use StatusFamily::{InProcess, Normal, Queued};

pub const STATUS_ENTRIES: &[StatusEntry] = &[
    row(S::Receiving, "RECEIVING", Normal),
    row(S::ReceivingInterrupt, "RECEIVING_INTERRUPT", Normal),
    row(S::Building, "BUILDING", Normal),
    row(S::Archiving, "ARCHIVING", Normal),
    row(S::Moving, "MOVING", Normal),
    row(S::Separating, "SEPARATING", Normal),
    row(S::Deleting, "DELETING", Normal),
    row(S::Conflict, "CONFLICT", Normal),
    row(S::Ready, "READY", Normal),
    row(S::Error, "ERROR", Normal),
    row(S::QueuedBuilding, "QUEUED_BUILDING", Queued),
    row(S::QueuedArchiving, "QUEUED_ARCHIVING", Queued),
    row(S::QueuedMoving, "QUEUED_MOVING", Queued),
    row(S::QueuedSeparating, "QUEUED_SEPARATING", Queued),
    row(S::QueuedDeleting, "QUEUED_DELETING", Queued),
    row(S::InProcessReceiving, "_RECEIVING", InProcess),
    row(S::InProcessReceivingInterrupt, "_RECEIVING_INTERRUPT", InProcess),
    row(S::InProcessBuilding, "_BUILDING", InProcess),
    row(S::InProcessArchiving, "_ARCHIVING", InProcess),
    row(S::InProcessMoving, "_MOVING", InProcess),
    row(S::InProcessSeparating, "_SEPARATING", InProcess),
    row(S::InProcessDeleting, "_DELETING", InProcess),
    row(S::InProcessConflict, "_CONFLICT", InProcess),
];

impl PrearcStatus {
    // Rows are declared in variant order.
    fn entry(self) -> &'static StatusEntry {
        &STATUS_ENTRIES[self as usize]
    }

    pub fn all() -> impl Iterator<Item = PrearcStatus> {
        STATUS_ENTRIES.iter().map(|e| e.status)
    }

    pub fn as_str(self) -> &'static str {
        self.entry().name
    }

    pub fn family(self) -> StatusFamily {
        self.entry().family
    }

    pub fn interruptable(self) -> bool {
        self.entry().interruptable
    }

    pub fn is_in_process(self) -> bool {
        self.family() == StatusFamily::InProcess
    }

    pub fn is_queued(self) -> bool {
        self.family() == StatusFamily::Queued
    }

    /// `READY` and `ERROR` are the only settled states.
    pub fn is_terminal(self) -> bool {
        matches!(self, PrearcStatus::Ready | PrearcStatus::Error)
    }
}

impl fmt::Display for PrearcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown prearchive status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for PrearcStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_ENTRIES
            .iter()
            .find(|e| e.name == s)
            .map(|e| e.status)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A missing record is optimistically "might be ready"; the caller does the real check.
pub fn potentially_ready(status: Option<PrearcStatus>) -> bool {
    matches!(status, None | Some(PrearcStatus::Ready))
}

/// Maps every normal, non-terminal status to the status named `_` + its name.
pub fn create_in_process_map() -> HashMap<PrearcStatus, PrearcStatus> {
    STATUS_ENTRIES
        .iter()
        .filter(|e| !e.status.is_terminal())
        .filter(|e| !e.name.starts_with('_') && !e.name.starts_with("QUEUED_"))
        .filter_map(|e| {
            format!("_{}", e.name)
                .parse::<PrearcStatus>()
                .ok()
                .map(|shadow| (e.status, shadow))
        })
        .collect()
}

/// Immutable lookup between normal statuses and their in-process shadows.
#[derive(Debug, Clone)]
pub struct StatusTable {
    in_process: HashMap<PrearcStatus, PrearcStatus>,
    settled: HashMap<PrearcStatus, PrearcStatus>,
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTable {
    pub fn new() -> Self {
        let in_process = create_in_process_map();
        let settled = in_process.iter().map(|(k, v)| (*v, *k)).collect();
        StatusTable {
            in_process,
            settled,
        }
    }

    /// The shadow for `status`, or `None` for terminal, queued and shadow states.
    pub fn in_process(&self, status: PrearcStatus) -> Option<PrearcStatus> {
        self.in_process.get(&status).copied()
    }

    /// The normal status a shadow stands in for.
    pub fn normal_of(&self, shadow: PrearcStatus) -> Option<PrearcStatus> {
        self.settled.get(&shadow).copied()
    }

    pub fn len(&self) -> usize {
        self.in_process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_process.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_exactly_one_table_row() {
        for (index, status) in PrearcStatus::all().enumerate() {
            assert_eq!(status as usize, index);
            let rows = STATUS_ENTRIES.iter().filter(|e| e.status == status).count();
            assert_eq!(rows, 1, "{status:?}");
            assert_eq!(status.as_str().parse::<PrearcStatus>().unwrap(), status);
        }
        assert_eq!(STATUS_ENTRIES.len(), 23);
    }

    #[test]
    fn in_process_map_covers_normal_non_terminal_states() {
        let map = create_in_process_map();
        for e in STATUS_ENTRIES {
            let expected = e.family == StatusFamily::Normal && !e.status.is_terminal();
            assert_eq!(map.contains_key(&e.status), expected, "{}", e.name);
            if let Some(shadow) = map.get(&e.status) {
                assert_eq!(shadow.as_str(), format!("_{}", e.name));
                assert!(shadow.is_in_process());
            }
        }
    }

    #[test]
    fn table_round_trips_shadows() {
        let table = StatusTable::new();
        assert_eq!(
            table.in_process(PrearcStatus::Deleting),
            Some(PrearcStatus::InProcessDeleting)
        );
        assert_eq!(
            table.normal_of(PrearcStatus::InProcessBuilding),
            Some(PrearcStatus::Building)
        );
        assert_eq!(table.in_process(PrearcStatus::Ready), None);
        assert_eq!(table.in_process(PrearcStatus::QueuedArchiving), None);
        assert_eq!(table.in_process(PrearcStatus::InProcessMoving), None);
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn potentially_ready_only_for_missing_or_ready() {
        assert!(potentially_ready(None));
        assert!(potentially_ready(Some(PrearcStatus::Ready)));
        for status in PrearcStatus::all().filter(|s| *s != PrearcStatus::Ready) {
            assert!(!potentially_ready(Some(status)), "{status}");
        }
    }

    #[test]
    fn nothing_is_marked_uninterruptable() {
        assert!(PrearcStatus::all().all(PrearcStatus::interruptable));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&PrearcStatus::InProcessDeleting).unwrap();
        assert_eq!(json, "\"_DELETING\"");
        let back: PrearcStatus = serde_json::from_str("\"QUEUED_MOVING\"").unwrap();
        assert_eq!(back, PrearcStatus::QueuedMoving);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!("_READY".parse::<PrearcStatus>().is_err());
        assert!("ready".parse::<PrearcStatus>().is_err());
    }
}
