//! Engine Configuration
//!
//! Optional YAML file that sets up the ambient services of an engine.
//!
//! ```yaml
//! persistence:
//!   directory: .bpmnrunner
//! debugger:
//!   enabled: true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// Enables file persistence in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerConfig {
    /// Reports every flow-object entry and exit to the log.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub debugger: DebuggerConfig,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;

        info!("Loaded engine configuration from: {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("engine.yaml");
        fs::write(
            &path,
            "persistence:\n  directory: /tmp/records\ndebugger:\n  enabled: true\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(
            config.persistence.directory,
            Some(PathBuf::from("/tmp/records"))
        );
        assert!(config.debugger.enabled);
    }

    #[test]
    fn test_missing_sections_default() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.persistence.directory.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/engine.yaml"),
            Err(DefinitionError::Io { .. })
        ));
    }
}
