//! Process Definition Module
//!
//! Provides the in-memory process graph consumed by the engine, plus
//! loading and structural validation.
//!
//! # Structure
//!
//! - [`model`]: Flow objects, sequence/message flows and the definition graph
//! - [`collaboration`]: Participants and message-flow resolution
//! - [`validator`]: Structural rules collected into an error queue
//! - [`loader`]: YAML/JSON loading with call-activity resolution

pub mod collaboration;
pub mod loader;
pub mod model;
pub mod validator;

pub use collaboration::Collaboration;
pub use loader::{load_collaboration, load_definition, load_definition_str, save_definition};
pub use model::{
    EventDefinition, FlowObject, FlowObjectKind, MessageFlow, Participant, ProcessDefinition,
    SequenceFlow, TaskType,
};
pub use validator::{validate, validate_definition, ErrorQueue, ValidationError};
