//! Process Execution Module
//!
//! Runs process instances over their definitions.
//!
//! # Components
//!
//! - [`engine`]: The [`ProcessEngine`] with its job queue and instance arena
//! - [`handlers`]: Registry of client handler code
//! - [`context`]: The facade handed to handler code
//! - [`state`]: Tokens and process state
//! - [`timers`]: Boundary and intermediate timer events
//! - [`instance`]: One running process
//! - `emission`: Token-emission rules per flow-object variant

pub mod context;
mod emission;
pub mod engine;
pub mod handlers;
pub mod instance;
pub mod state;
pub mod timers;

pub use context::HandlerContext;
pub use engine::{ProcessEngine, PROCESS_ID_SEPARATOR};
pub use handlers::{
    handler_name, EventType, HandlerOutcome, Handlers, UnhandledEvent, DONE_SUFFIX,
    GUARD_SEPARATOR, TIMEOUT_SUFFIX,
};
pub use instance::{ParentLink, ProcessInstance};
pub use state::{ProcessState, Token};
pub use timers::{parse_timeout, PendingTimerEvents, PersistedTimeout, TimerFired, TimerKind};
