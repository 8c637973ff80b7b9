//! Handler Context
//!
//! The facade handed to handler code. It gives read access to the state
//! and history of the process the handler runs in, read/write access to
//! its properties, and lets the handler raise further signals.
//!
//! Signals raised from a handler are buffered and dispatched by the engine
//! once the handler has returned, never inline.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::monitoring::History;
use crate::process::state::ProcessState;

/// A signal raised from handler code.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    TriggerEvent { name: String, data: Value },
    TaskDone { name: String, data: Value },
    SendMessage { name: String, data: Value },
    HandlerDone { name: String, data: Value },
}

pub struct HandlerContext<'a> {
    process_id: &'a str,
    flow_object_name: &'a str,
    properties: &'a mut BTreeMap<String, Value>,
    state: &'a ProcessState,
    history: &'a History,
    commands: Vec<Command>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        process_id: &'a str,
        flow_object_name: &'a str,
        properties: &'a mut BTreeMap<String, Value>,
        state: &'a ProcessState,
        history: &'a History,
    ) -> Self {
        Self {
            process_id,
            flow_object_name,
            properties,
            state,
            history,
            commands: Vec::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        self.process_id
    }

    /// Name of the flow object whose handler is running.
    pub fn flow_object_name(&self) -> &str {
        self.flow_object_name
    }

    pub fn state(&self) -> &ProcessState {
        self.state
    }

    pub fn history(&self) -> &History {
        self.history
    }

    pub fn get_property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    pub fn trigger_event(&mut self, name: impl Into<String>, data: Value) {
        self.commands.push(Command::TriggerEvent {
            name: name.into(),
            data,
        });
    }

    pub fn task_done(&mut self, name: impl Into<String>, data: Value) {
        self.commands.push(Command::TaskDone {
            name: name.into(),
            data,
        });
    }

    pub fn send_message(&mut self, name: impl Into<String>, data: Value) {
        self.commands.push(Command::SendMessage {
            name: name.into(),
            data,
        });
    }

    /// Completes a handler that returned [`HandlerOutcome::Pending`].
    ///
    /// [`HandlerOutcome::Pending`]: crate::process::HandlerOutcome::Pending
    pub fn complete(&mut self, name: impl Into<String>, data: Value) {
        self.commands.push(Command::HandlerDone {
            name: name.into(),
            data,
        });
    }

    pub(crate) fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_properties_and_commands() {
        let mut properties = BTreeMap::new();
        let state = ProcessState::new();
        let history = History::new();

        let mut ctx = HandlerContext::new("p", "Review", &mut properties, &state, &history);
        assert_eq!(ctx.flow_object_name(), "Review");
        ctx.set_property("approved", json!(true));
        assert_eq!(ctx.get_property("approved"), Some(&json!(true)));

        ctx.trigger_event("Cancel", Value::Null);
        ctx.task_done("Review", json!({"ok": true}));
        let commands = ctx.into_commands();

        assert_eq!(commands.len(), 2);
        assert!(matches!(&commands[0], Command::TriggerEvent { name, .. } if name == "Cancel"));
        assert_eq!(properties.get("approved"), Some(&json!(true)));
    }
}
