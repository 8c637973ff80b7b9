//! Process Persistence
//!
//! Only main process instances are persisted. Nested call-activity and
//! sub-process instances are embedded in the main record through the
//! `substate` of their call-activity token and the `subhistory` of the
//! call-activity history entry.
//!
//! # Backends
//!
//! - [`FilePersistence`]: one JSON document per process in a directory
//! - [`InMemoryPersistence`]: shared map, useful for tests and embedding
//!
//! # Record Format
//!
//! ```json
//! {
//!   "processName": "Order",
//!   "processId": "order-1",
//!   "parentToken": null,
//!   "properties": {},
//!   "state": { "tokens": [] },
//!   "history": { "historyEntries": [], "createdAt": "...", "finishedAt": null },
//!   "pendingTimeouts": { "Reminder": { "timeout": 60000 } },
//!   "views": { "startEvent": null, "endEvent": null, "duration": null }
//! }
//! ```

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PersistenceError;
use crate::monitoring::{History, HistoryEntry};
use crate::process::state::{ProcessState, Token};
use crate::process::timers::PersistedTimeout;

pub use file::FilePersistence;
pub use memory::InMemoryPersistence;

/// Derived summary of a persisted process.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Views {
    /// First start-event entry of the history.
    pub start_event: Option<HistoryEntry>,
    /// Last end-event entry of the history.
    pub end_event: Option<HistoryEntry>,
    /// Milliseconds between `createdAt` and `finishedAt`.
    pub duration: Option<i64>,
}

impl Views {
    pub fn from_history(history: &History) -> Self {
        Self {
            start_event: history.first_entry_of_type("startEvent").cloned(),
            end_event: history.last_entry_of_type("endEvent").cloned(),
            duration: history.duration_ms(),
        }
    }
}

/// Persisted snapshot of a main process instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub process_name: String,
    pub process_id: String,
    #[serde(default)]
    pub parent_token: Option<Token>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub state: ProcessState,
    pub history: History,
    #[serde(default)]
    pub pending_timeouts: BTreeMap<String, PersistedTimeout>,
    #[serde(default)]
    pub views: Views,
}

/// Storage backend for process records.
///
/// Backends are called synchronously from the engine. While a call is in
/// progress the engine defers every signal raised for the affected process.
pub trait Persistence: Send {
    /// Stores a record, replacing any earlier record of the same process.
    /// Returns the record as stored.
    fn persist(&mut self, record: &PersistedRecord) -> Result<PersistedRecord, PersistenceError>;

    /// Loads the record of a process, or `None` if it was never persisted.
    fn load(
        &mut self,
        process_id: &str,
        process_name: &str,
    ) -> Result<Option<PersistedRecord>, PersistenceError>;

    /// Releases the backend. Later calls fail with [`PersistenceError::Closed`].
    fn close(&mut self) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shape_is_camel_case() {
        let mut history = History::new();
        history.add_entry("Start", "startEvent");

        let record = PersistedRecord {
            process_name: "Order".to_string(),
            process_id: "order-1".to_string(),
            parent_token: None,
            properties: BTreeMap::new(),
            state: ProcessState::new(),
            views: Views::from_history(&history),
            history,
            pending_timeouts: BTreeMap::from([(
                "Reminder".to_string(),
                PersistedTimeout { timeout: 60000 },
            )]),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["processName"], "Order");
        assert_eq!(json["processId"], "order-1");
        assert!(json["parentToken"].is_null());
        assert_eq!(json["state"]["tokens"], serde_json::json!([]));
        assert_eq!(json["pendingTimeouts"]["Reminder"]["timeout"], 60000);
        assert_eq!(json["views"]["startEvent"]["name"], "Start");
        assert!(json["views"]["endEvent"].is_null());
        assert!(json["history"]["historyEntries"].is_array());
    }

    #[test]
    fn test_views_duration_requires_finish() {
        let mut history = History::new();
        history.add_entry("End", "endEvent");
        assert_eq!(Views::from_history(&history).duration, None);

        history.set_end("End");
        let views = Views::from_history(&history);
        assert!(views.duration.is_some());
        assert_eq!(views.end_event.unwrap().name, "End");
    }
}
