//! Process Instance
//!
//! One running process in the engine arena. Instances hold their state and
//! history by value and refer to each other only by process id: a called
//! process names its parent through [`ParentLink`], a parent lists its
//! running called processes in `called_processes`, and every instance knows
//! the id of the main process whose deferral queue it shares.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::context::HandlerContext;
use super::engine::Job;
use super::handlers::Handlers;
use super::state::ProcessState;
use super::timers::{PendingTimerEvents, TimerFired};
use crate::definition::ProcessDefinition;
use crate::monitoring::History;

/// Link from a called process to the call activity that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub process_id: String,
    pub activity: String,
}

/// Which handler a pending completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Handler run on token arrival.
    Arrival,
    /// `<name>Done` handler of a wait task.
    Completion,
    /// Handler of a triggered catch event.
    Catch,
}

#[derive(Debug, Clone)]
pub(crate) struct Continuation {
    pub name: String,
    pub phase: Phase,
}

/// Signals held back while persistence I/O is outstanding.
#[derive(Debug, Default)]
pub(crate) struct Deferral {
    pub deferring: bool,
    pub queue: VecDeque<Job>,
}

#[derive(Debug)]
pub struct ProcessInstance {
    pub(crate) id: String,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) handlers: Arc<Handlers>,
    pub(crate) state: ProcessState,
    pub(crate) history: History,
    pub(crate) properties: BTreeMap<String, Value>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) main_process_id: String,
    pub(crate) called_processes: BTreeSet<String>,
    pub(crate) timers: PendingTimerEvents,
    pub(crate) deferral: Deferral,
    pub(crate) awaiting: Vec<Continuation>,
    /// Definition id to process id of collaborating main processes.
    pub(crate) collaborators: BTreeMap<String, String>,
    pub(crate) finished: bool,
}

impl ProcessInstance {
    pub(crate) fn new(
        id: impl Into<String>,
        definition: Arc<ProcessDefinition>,
        handlers: Arc<Handlers>,
        parent: Option<ParentLink>,
        main_process_id: impl Into<String>,
        timer_sender: UnboundedSender<TimerFired>,
    ) -> Self {
        let id = id.into();
        Self {
            timers: PendingTimerEvents::new(id.clone(), timer_sender),
            id,
            definition,
            handlers,
            state: ProcessState::new(),
            history: History::new(),
            properties: BTreeMap::new(),
            parent,
            main_process_id: main_process_id.into(),
            called_processes: BTreeSet::new(),
            deferral: Deferral::default(),
            awaiting: Vec::new(),
            collaborators: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    /// Own state; tokens of called processes carry no substate here.
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Own history; running called processes are not yet folded in.
    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn is_main(&self) -> bool {
        self.parent.is_none()
    }

    pub fn main_process_id(&self) -> &str {
        &self.main_process_id
    }

    pub fn called_processes(&self) -> impl Iterator<Item = &str> {
        self.called_processes.iter().map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn context<'a>(&'a mut self, flow_object_name: &'a str) -> HandlerContext<'a> {
        HandlerContext::new(
            &self.id,
            flow_object_name,
            &mut self.properties,
            &self.state,
            &self.history,
        )
    }

    /// Removes and returns the pending completion of `name`.
    pub(crate) fn take_continuation(&mut self, name: &str) -> Option<Phase> {
        let index = self.awaiting.iter().position(|c| c.name == name)?;
        Some(self.awaiting.remove(index).phase)
    }

    pub(crate) fn is_awaiting(&self, name: &str) -> bool {
        self.awaiting.iter().any(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_new_instance_is_main_without_parent() {
        let (tx, _rx) = unbounded_channel();
        let definition = Arc::new(ProcessDefinition::new("p", "P"));
        let instance =
            ProcessInstance::new("p1", definition, Arc::new(Handlers::new()), None, "p1", tx);

        assert!(instance.is_main());
        assert_eq!(instance.main_process_id(), "p1");
        assert!(!instance.state().has_tokens());
        assert_eq!(instance.called_processes().count(), 0);
    }

    #[test]
    fn test_continuations() {
        let (tx, _rx) = unbounded_channel();
        let definition = Arc::new(ProcessDefinition::new("p", "P"));
        let mut instance = ProcessInstance::new(
            "p1::Call",
            definition,
            Arc::new(Handlers::new()),
            Some(ParentLink {
                process_id: "p1".to_string(),
                activity: "Call".to_string(),
            }),
            "p1",
            tx,
        );
        assert!(!instance.is_main());

        instance.awaiting.push(Continuation {
            name: "Check".to_string(),
            phase: Phase::Arrival,
        });
        assert!(instance.is_awaiting("Check"));
        assert_eq!(instance.take_continuation("Check"), Some(Phase::Arrival));
        assert_eq!(instance.take_continuation("Check"), None);
    }
}
