//! BpmnRunner - Embeddable BPMN Process Engine
//!
//! Executes BPMN process definitions inside an application. The application
//! supplies the behavior of tasks, events and gateway conditions as
//! handlers; the engine moves tokens through the process graph, runs the
//! handlers, keeps an audit trail and persists every running process at its
//! wait points.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`definition`]: Process graphs, collaborations, loading and validation
//! - [`process`]: The execution engine, handlers, tokens and timers
//! - [`persistence`]: Persisted process records and their backends
//! - [`monitoring`]: Process history and position reporting
//! - [`config`]: Engine configuration file
//!
//! # Example
//!
//! ```rust,no_run
//! use bpmnrunner::load_definition;
//! use bpmnrunner::persistence::FilePersistence;
//! use bpmnrunner::process::{HandlerOutcome, Handlers};
//! use bpmnrunner::ProcessEngine;
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a process definition from YAML
//!     let definition = load_definition("order.yaml")?;
//!
//!     let handlers = Handlers::new()
//!         .on("Check Order", |ctx, data| {
//!             ctx.set_property("order", data.clone());
//!             HandlerOutcome::done()
//!         });
//!
//!     // Create engine with file persistence
//!     let mut engine = ProcessEngine::new();
//!     engine.set_persistence(FilePersistence::new("/var/lib/orders"));
//!
//!     engine.create_process(definition, handlers, "order-42")?;
//!     engine.trigger_event("order-42", "Order Received", json!({"item": "book"}))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod definition;
pub mod error;
pub mod monitoring;
pub mod persistence;
pub mod process;

// Re-export commonly used types
pub use config::EngineConfig;
pub use definition::{load_collaboration, load_definition, ProcessDefinition};
pub use error::{DefinitionError, EngineError, PersistenceError};
pub use process::{HandlerContext, HandlerOutcome, Handlers, ProcessEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "BpmnRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "BpmnRunner");
    }

    #[test]
    fn test_module_exports_engine() {
        let engine = ProcessEngine::default();
        assert!(engine.process_ids().is_empty());
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = ProcessDefinition::new("p", "Process");
        assert_eq!(definition.name, "Process");
        assert!(definition.flow_objects().is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
