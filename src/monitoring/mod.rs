//! Monitoring Module
//!
//! Audit trail and position reporting for running processes.
//!
//! # Components
//!
//! - [`History`]: begin/end timestamps per visited flow object
//! - [`PositionListener`]: entry/exit notifications for debuggers

pub mod history;
pub mod position;

pub use history::{History, HistoryEntry};
pub use position::{ListenerResult, LoggingPositionListener, PositionListener};
