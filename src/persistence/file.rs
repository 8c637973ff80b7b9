//! File Persistence
//!
//! Stores one pretty-printed JSON document per process under a directory:
//! `{directory}/{process_name}_{process_id}.json`. The directory is created
//! on the first save.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::{PersistedRecord, Persistence};
use crate::error::PersistenceError;

/// Default directory used when none is configured.
pub const DEFAULT_DIRECTORY: &str = ".bpmnrunner";

#[derive(Debug, Clone)]
pub struct FilePersistence {
    directory: PathBuf,
    closed: bool,
}

impl FilePersistence {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            closed: false,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the file a process is stored in.
    pub fn record_path(&self, process_id: &str, process_name: &str) -> PathBuf {
        self.directory.join(format!(
            "{}_{}.json",
            sanitize(process_name),
            sanitize(process_id)
        ))
    }

    /// Deletes the stored record of a process, if any.
    pub fn delete(&self, process_id: &str, process_name: &str) -> Result<(), PersistenceError> {
        let path = self.record_path(process_id, process_name);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Deleted process record: {}", path.display());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed {
            Err(PersistenceError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for FilePersistence {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTORY)
    }
}

impl Persistence for FilePersistence {
    fn persist(&mut self, record: &PersistedRecord) -> Result<PersistedRecord, PersistenceError> {
        self.ensure_open()?;
        fs::create_dir_all(&self.directory)?;

        let path = self.record_path(&record.process_id, &record.process_name);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;

        info!("Saved process '{}' to {}", record.process_id, path.display());
        Ok(record.clone())
    }

    fn load(
        &mut self,
        process_id: &str,
        process_name: &str,
    ) -> Result<Option<PersistedRecord>, PersistenceError> {
        self.ensure_open()?;

        let path = self.record_path(process_id, process_name);
        if !path.exists() {
            debug!("No stored record for process '{}'", process_id);
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let record: PersistedRecord = serde_json::from_str(&content)?;

        info!("Loaded process '{}' from {}", process_id, path.display());
        Ok(Some(record))
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        Ok(())
    }
}

/// Keeps file names portable.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::History;
    use crate::persistence::Views;
    use crate::process::state::ProcessState;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn create_record(process_id: &str) -> PersistedRecord {
        let mut state = ProcessState::new();
        state.create_token_at("Review", process_id, None);

        let mut history = History::new();
        history.add_entry("Start", "startEvent");
        history.set_end("Start");
        history.add_entry("Review", "userTask");

        PersistedRecord {
            process_name: "Order Process".to_string(),
            process_id: process_id.to_string(),
            parent_token: None,
            properties: BTreeMap::from([("amount".to_string(), serde_json::json!(42))]),
            state,
            views: Views::from_history(&history),
            history,
            pending_timeouts: BTreeMap::new(),
        }
    }

    #[test]
    fn test_save_and_load_record() {
        let temp_dir = tempdir().unwrap();
        let mut persistence = FilePersistence::new(temp_dir.path().join("state"));

        let record = create_record("order-1");
        persistence.persist(&record).unwrap();

        let path = persistence.record_path("order-1", "Order Process");
        assert!(path.exists());
        assert!(path.ends_with("Order_Process_order-1.json"));

        let loaded = persistence.load("order-1", "Order Process").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_record() {
        let temp_dir = tempdir().unwrap();
        let mut persistence = FilePersistence::new(temp_dir.path());
        assert!(persistence.load("nope", "Nothing").unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_record() {
        let temp_dir = tempdir().unwrap();
        let mut persistence = FilePersistence::new(temp_dir.path());
        fs::write(persistence.record_path("bad", "P"), "{ not json").unwrap();

        assert!(matches!(
            persistence.load("bad", "P"),
            Err(PersistenceError::Serialization(_))
        ));
    }

    #[test]
    fn test_closed_backend_rejects_calls() {
        let temp_dir = tempdir().unwrap();
        let mut persistence = FilePersistence::new(temp_dir.path());
        persistence.close().unwrap();

        assert!(matches!(
            persistence.persist(&create_record("p")),
            Err(PersistenceError::Closed)
        ));
        assert!(matches!(
            persistence.load("p", "P"),
            Err(PersistenceError::Closed)
        ));
    }

    #[test]
    fn test_delete_record() {
        let temp_dir = tempdir().unwrap();
        let mut persistence = FilePersistence::new(temp_dir.path());
        persistence.persist(&create_record("order-2")).unwrap();

        persistence.delete("order-2", "Order Process").unwrap();
        assert!(!persistence.record_path("order-2", "Order Process").exists());
        // Deleting twice is fine
        assert!(persistence.delete("order-2", "Order Process").is_ok());
    }
}
