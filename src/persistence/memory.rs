//! In-memory persistence shared between clones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use super::{PersistedRecord, Persistence};
use crate::error::PersistenceError;

/// Keeps records in a shared map keyed by process id.
///
/// Clones share the same map, so a test can keep one handle to inspect
/// what the engine stored, or hand a second clone to a fresh engine to
/// simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    records: Arc<Mutex<HashMap<String, PersistedRecord>>>,
    closed: bool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored record.
    pub fn get(&self, process_id: &str) -> Option<PersistedRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(process_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PersistedRecord>>, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }
        self.records.lock().map_err(|_| {
            PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "record store lock poisoned",
            ))
        })
    }
}

impl Persistence for InMemoryPersistence {
    fn persist(&mut self, record: &PersistedRecord) -> Result<PersistedRecord, PersistenceError> {
        let mut records = self.lock()?;
        records.insert(record.process_id.clone(), record.clone());
        debug!("Stored process '{}' in memory", record.process_id);
        Ok(record.clone())
    }

    fn load(
        &mut self,
        process_id: &str,
        _process_name: &str,
    ) -> Result<Option<PersistedRecord>, PersistenceError> {
        let records = self.lock()?;
        Ok(records.get(process_id).cloned())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::History;
    use crate::persistence::Views;
    use crate::process::state::ProcessState;
    use std::collections::BTreeMap;

    fn create_record(process_id: &str) -> PersistedRecord {
        PersistedRecord {
            process_name: "P".to_string(),
            process_id: process_id.to_string(),
            parent_token: None,
            properties: BTreeMap::new(),
            state: ProcessState::new(),
            history: History::new(),
            pending_timeouts: BTreeMap::new(),
            views: Views::default(),
        }
    }

    #[test]
    fn test_clones_share_records() {
        let mut persistence = InMemoryPersistence::new();
        let observer = persistence.clone();
        assert!(observer.is_empty());

        persistence.persist(&create_record("a")).unwrap();
        assert_eq!(observer.len(), 1);
        assert!(observer.get("a").is_some());

        let mut restarted = observer.clone();
        assert!(restarted.load("a", "P").unwrap().is_some());
        assert!(restarted.load("b", "P").unwrap().is_none());
    }

    #[test]
    fn test_close_only_affects_handle() {
        let mut persistence = InMemoryPersistence::new();
        let mut other = persistence.clone();
        persistence.close().unwrap();

        assert!(matches!(
            persistence.persist(&create_record("a")),
            Err(PersistenceError::Closed)
        ));
        assert!(other.persist(&create_record("a")).is_ok());
    }
}
