//! Handler Registry
//!
//! The embedding application supplies the behavior of a process as a set of
//! handlers keyed by flow-object name:
//!
//! - `<name>`: runs when a token arrives (tasks, events, gateways) or when
//!   a catch event is triggered
//! - `<name>Done`: runs when a wait task is completed with `task_done`
//! - `<gateway>$<flow>`: guard of an outgoing flow of an exclusive gateway
//! - `<name>$getTimeout`: duration of a timer event in milliseconds
//! - nested registries keyed by call-activity or sub-process name
//!
//! A name that is not registered is retried under its mapped form, where
//! every character that is not alphanumeric is replaced with `_`
//! (`"Approve Order?"` becomes `"Approve_Order_"`).
//!
//! # Example
//!
//! ```rust
//! use bpmnrunner::process::{HandlerOutcome, Handlers};
//! use serde_json::json;
//!
//! let handlers = Handlers::new()
//!     .on("Check Stock", |ctx, _data| {
//!         ctx.set_property("inStock", json!(true));
//!         HandlerOutcome::done()
//!     })
//!     .guard("In Stock?", "yes", |ctx, _data| {
//!         ctx.get_property("inStock") == Some(&json!(true))
//!     })
//!     .timeout("Payment Deadline", |_ctx, _data| json!(60_000));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::Value;

use super::context::HandlerContext;
use crate::error::{EngineError, PersistenceError};
use crate::persistence::PersistedRecord;

/// Separator between a gateway name and an outgoing flow name.
pub const GUARD_SEPARATOR: &str = "$";

/// Suffix of timeout handlers.
pub const TIMEOUT_SUFFIX: &str = "$getTimeout";

/// Suffix of wait-task completion handlers.
pub const DONE_SUFFIX: &str = "Done";

/// Result of a task or event handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The handler finished. `Some` replaces the data passed downstream.
    Done(Option<Value>),
    /// The handler completes later through `handler_done`.
    Pending,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::Done(None)
    }

    pub fn with_data(data: Value) -> Self {
        Self::Done(Some(data))
    }
}

/// Signal kinds reported to the default event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TokenArrived,
    ActivityEnd,
    IntermediateCatch,
    BoundaryCatch,
    TriggerEvent,
    SendMessage,
    HandlerDone,
    GatewayGuard,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TokenArrived => "tokenArrived",
            Self::ActivityEnd => "activityEnd",
            Self::IntermediateCatch => "intermediateCatch",
            Self::BoundaryCatch => "boundaryCatch",
            Self::TriggerEvent => "triggerEvent",
            Self::SendMessage => "sendMessage",
            Self::HandlerDone => "handlerDone",
            Self::GatewayGuard => "gatewayGuard",
        };
        f.write_str(name)
    }
}

/// A signal the engine could not dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct UnhandledEvent {
    pub process_id: String,
    pub event_type: EventType,
    pub flow_object_name: String,
    pub handler_name: String,
    pub reason: String,
}

impl UnhandledEvent {
    /// Missing handlers are part of normal operation; everything else is a
    /// bad external signal.
    pub fn is_missing_handler(&self) -> bool {
        self.event_type == EventType::TokenArrived
    }
}

impl fmt::Display for UnhandledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} '{}' (handler '{}'): {}",
            self.process_id, self.event_type, self.flow_object_name, self.handler_name, self.reason
        )
    }
}

pub type TaskHandler = Arc<dyn Fn(&mut HandlerContext<'_>, &Value) -> HandlerOutcome + Send + Sync>;
pub type GuardHandler = Arc<dyn Fn(&mut HandlerContext<'_>, &Value) -> bool + Send + Sync>;
pub type TimeoutHandler = Arc<dyn Fn(&mut HandlerContext<'_>, &Value) -> Value + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&UnhandledEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&EngineError) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;
pub type SavedHandler = Arc<
    dyn Fn(&mut HandlerContext<'_>, Result<&PersistedRecord, &PersistenceError>) + Send + Sync,
>;
pub type LoadedHandler = Arc<
    dyn Fn(&mut HandlerContext<'_>, Result<Option<&PersistedRecord>, &PersistenceError>)
        + Send
        + Sync,
>;

/// Maps a flow-object name to its fallback handler name.
pub fn handler_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn default_event_handler(event: &UnhandledEvent) {
    if event.is_missing_handler() {
        debug!("{}", event);
    } else {
        warn!("Unhandled event: {}", event);
    }
}

fn default_error_handler(err: &EngineError) {
    error!("{}", err);
}

/// Handlers of one process definition.
#[derive(Clone, Default)]
pub struct Handlers {
    tasks: HashMap<String, TaskHandler>,
    guards: HashMap<String, GuardHandler>,
    timeouts: HashMap<String, TimeoutHandler>,
    nested: HashMap<String, Handlers>,
    event_handler: Option<EventHandler>,
    error_handler: Option<ErrorHandler>,
    begin_handler: Option<LifecycleHandler>,
    end_handler: Option<LifecycleHandler>,
    saved_handler: Option<SavedHandler>,
    loaded_handler: Option<LoadedHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler of a flow object.
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, &Value) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(handler));
        self
    }

    /// Registers the completion handler of a wait task.
    pub fn on_done<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, &Value) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.tasks
            .insert(format!("{}{}", name, DONE_SUFFIX), Arc::new(handler));
        self
    }

    /// Registers the guard of the flow `flow` leaving gateway `gateway`.
    pub fn guard<F>(mut self, gateway: &str, flow: &str, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, &Value) -> bool + Send + Sync + 'static,
    {
        self.guards
            .insert(guard_key(gateway, flow), Arc::new(handler));
        self
    }

    /// Registers the duration handler of a timer event.
    pub fn timeout<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, &Value) -> Value + Send + Sync + 'static,
    {
        self.timeouts
            .insert(format!("{}{}", name, TIMEOUT_SUFFIX), Arc::new(handler));
        self
    }

    /// Registers the handlers of a call activity or sub-process.
    pub fn nested(mut self, activity: impl Into<String>, handlers: Handlers) -> Self {
        self.nested.insert(activity.into(), handlers);
        self
    }

    pub fn default_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UnhandledEvent) + Send + Sync + 'static,
    {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    pub fn default_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Called with `(process_id, flow_object_name, data)` when a flow
    /// object is entered.
    pub fn on_begin<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        self.begin_handler = Some(Arc::new(handler));
        self
    }

    /// Called with `(process_id, flow_object_name, data)` when a flow
    /// object is left.
    pub fn on_end<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        self.end_handler = Some(Arc::new(handler));
        self
    }

    pub fn done_saving<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, Result<&PersistedRecord, &PersistenceError>)
            + Send
            + Sync
            + 'static,
    {
        self.saved_handler = Some(Arc::new(handler));
        self
    }

    pub fn done_loading<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_>, Result<Option<&PersistedRecord>, &PersistenceError>)
            + Send
            + Sync
            + 'static,
    {
        self.loaded_handler = Some(Arc::new(handler));
        self
    }

    /// Looks up a task handler under its exact key, then its mapped key.
    pub fn task(&self, key: &str) -> Option<&TaskHandler> {
        lookup(&self.tasks, key)
    }

    pub fn done_handler(&self, name: &str) -> Option<&TaskHandler> {
        self.task(&format!("{}{}", name, DONE_SUFFIX))
    }

    pub fn guard_handler(&self, gateway: &str, flow: &str) -> Option<&GuardHandler> {
        lookup(&self.guards, &guard_key(gateway, flow))
    }

    pub fn timeout_handler(&self, name: &str) -> Option<&TimeoutHandler> {
        lookup(&self.timeouts, &format!("{}{}", name, TIMEOUT_SUFFIX))
    }

    /// Registry used by the nested process of `activity`.
    ///
    /// Hooks not set on the nested registry are inherited from this one. If
    /// no nested registry is registered, this registry is used as is.
    pub fn nested_for(&self, activity: &str) -> Handlers {
        let nested = self
            .nested
            .get(activity)
            .or_else(|| self.nested.get(&handler_name(activity)));

        match nested {
            Some(nested) => {
                let mut nested = nested.clone();
                nested.event_handler = nested.event_handler.or_else(|| self.event_handler.clone());
                nested.error_handler = nested.error_handler.or_else(|| self.error_handler.clone());
                nested.begin_handler = nested.begin_handler.or_else(|| self.begin_handler.clone());
                nested.end_handler = nested.end_handler.or_else(|| self.end_handler.clone());
                nested
            }
            None => self.clone(),
        }
    }

    pub fn report_event(&self, event: &UnhandledEvent) {
        match &self.event_handler {
            Some(handler) => handler(event),
            None => default_event_handler(event),
        }
    }

    pub fn report_error(&self, err: &EngineError) {
        match &self.error_handler {
            Some(handler) => handler(err),
            None => default_error_handler(err),
        }
    }

    pub fn begin(&self, process_id: &str, name: &str, data: &Value) {
        if let Some(handler) = &self.begin_handler {
            handler(process_id, name, data);
        }
    }

    pub fn end(&self, process_id: &str, name: &str, data: &Value) {
        if let Some(handler) = &self.end_handler {
            handler(process_id, name, data);
        }
    }

    pub(crate) fn saved_handler(&self) -> Option<&SavedHandler> {
        self.saved_handler.as_ref()
    }

    pub(crate) fn loaded_handler(&self) -> Option<&LoadedHandler> {
        self.loaded_handler.as_ref()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tasks: Vec<&String> = self.tasks.keys().collect();
        tasks.sort();
        let mut nested: Vec<&String> = self.nested.keys().collect();
        nested.sort();

        f.debug_struct("Handlers")
            .field("tasks", &tasks)
            .field("guards", &self.guards.len())
            .field("timeouts", &self.timeouts.len())
            .field("nested", &nested)
            .finish()
    }
}

fn guard_key(gateway: &str, flow: &str) -> String {
    format!("{}{}{}", gateway, GUARD_SEPARATOR, flow)
}

fn lookup<'a, T>(map: &'a HashMap<String, T>, key: &str) -> Option<&'a T> {
    map.get(key).or_else(|| map.get(&handler_name(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handler_name_mapping() {
        assert_eq!(handler_name("Approve Order?"), "Approve_Order_");
        assert_eq!(handler_name("Plain"), "Plain");
        assert_eq!(handler_name("a-b:c"), "a_b_c");
    }

    #[test]
    fn test_lookup_falls_back_to_mapped_name() {
        let handlers = Handlers::new()
            .on("Check_Stock", |_ctx, _data| HandlerOutcome::done())
            .on_done("Review", |_ctx, _data| HandlerOutcome::done())
            .guard("Ok?", "yes", |_ctx, _data| true)
            .timeout("Wait", |_ctx, _data| json!(5));

        assert!(handlers.task("Check Stock").is_some());
        assert!(handlers.task("Unknown").is_none());
        assert!(handlers.done_handler("Review").is_some());
        assert!(handlers.guard_handler("Ok?", "yes").is_some());
        assert!(handlers.guard_handler("Ok?", "no").is_none());
        assert!(handlers.timeout_handler("Wait").is_some());
    }

    #[test]
    fn test_nested_registry_inherits_hooks() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);

        let handlers = Handlers::new()
            .default_error_handler(move |_err| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .nested(
                "Call Shipping",
                Handlers::new().on("Ship", |_ctx, _data| HandlerOutcome::done()),
            );

        let nested = handlers.nested_for("Call Shipping");
        assert!(nested.task("Ship").is_some());
        nested.report_error(&EngineError::MissingTimeoutHandler {
            handler: "x".to_string(),
        });
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Without a nested registry the parent registry applies
        let fallback = handlers.nested_for("Other");
        assert!(fallback.task("Ship").is_none());
    }

    #[test]
    fn test_unhandled_event_display() {
        let event = UnhandledEvent {
            process_id: "p".to_string(),
            event_type: EventType::TriggerEvent,
            flow_object_name: "Nope".to_string(),
            handler_name: "Nope".to_string(),
            reason: "no such flow object".to_string(),
        };
        assert!(!event.is_missing_handler());
        assert_eq!(
            event.to_string(),
            "[p] triggerEvent 'Nope' (handler 'Nope'): no such flow object"
        );
    }
}
