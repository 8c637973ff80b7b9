//! Process Engine
//!
//! Runs process instances over their definitions:
//! - Token movement with the per-variant emission rules
//! - Call activities and sub-processes as nested instances
//! - Boundary and intermediate timer events
//! - Persistence of the main instance at every wait point
//!
//! # Structure
//!
//! All instances live in one arena keyed by process id. A called process
//! gets the id `<parent id>::<activity name>` and refers to its parent by
//! id only. Work is a queue of jobs processed one at a time; tokens emitted
//! by a flow object are queued in front so one activation runs to
//! completion before anything raised from handler code.
//!
//! While a persistence call is in progress the main process is *deferring*:
//! signals raised for it or any of its nested processes are held back and
//! queued again once the call has returned.
//!
//! # Example
//!
//! ```rust,no_run
//! use bpmnrunner::definition::load_definition;
//! use bpmnrunner::process::{HandlerOutcome, Handlers, ProcessEngine};
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition = load_definition("order.yaml")?;
//!     let handlers = Handlers::new()
//!         .on("Check Order", |_ctx, _data| HandlerOutcome::done())
//!         .guard("Valid?", "yes", |_ctx, data| data["valid"] == json!(true));
//!
//!     let mut engine = ProcessEngine::new();
//!     engine.create_process(definition, handlers, "order-1")?;
//!     engine.trigger_event("order-1", "Start", json!({"valid": true}))?;
//!     engine.task_done("order-1", "Review Order", json!(null))?;
//!
//!     println!("Finished: {}", engine.is_finished("order-1")?);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::context::{Command, HandlerContext};
use super::emission::{self, ArrivalRule, Emission};
use super::handlers::{
    handler_name, EventType, HandlerOutcome, Handlers, UnhandledEvent, DONE_SUFFIX,
    GUARD_SEPARATOR, TIMEOUT_SUFFIX,
};
use super::instance::{Continuation, ParentLink, Phase, ProcessInstance};
use super::state::ProcessState;
use super::timers::{parse_timeout, PersistedTimeout, TimerFired, TimerKind};
use crate::config::EngineConfig;
use crate::definition::{FlowObject, ProcessDefinition, SequenceFlow};
use crate::error::{EngineError, PersistenceError};
use crate::monitoring::{History, LoggingPositionListener, PositionListener};
use crate::persistence::{FilePersistence, PersistedRecord, Persistence, Views};

/// Separator between a parent process id and a call-activity name.
pub const PROCESS_ID_SEPARATOR: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    TokenArrived,
    ActivityEnd,
    IntermediateCatch,
    BoundaryCatch,
    HandlerDone,
    TriggerEvent,
    TaskDone,
    SendMessage,
}

/// A queued signal for one process instance.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    signal: Signal,
    process_id: String,
    name: String,
    data: Value,
}

impl Job {
    fn new(signal: Signal, process_id: &str, name: impl Into<String>, data: Value) -> Self {
        Self {
            signal,
            process_id: process_id.to_string(),
            name: name.into(),
            data,
        }
    }
}

/// Executes process instances.
pub struct ProcessEngine {
    instances: HashMap<String, ProcessInstance>,
    queue: VecDeque<Job>,
    persistence: Option<Box<dyn Persistence>>,
    position_listener: Option<Box<dyn PositionListener>>,
    timer_sender: UnboundedSender<TimerFired>,
    timer_receiver: UnboundedReceiver<TimerFired>,
}

impl ProcessEngine {
    /// Creates an engine without persistence.
    pub fn new() -> Self {
        let (timer_sender, timer_receiver) = unbounded_channel();
        Self {
            instances: HashMap::new(),
            queue: VecDeque::new(),
            persistence: None,
            position_listener: None,
            timer_sender,
            timer_receiver,
        }
    }

    /// Creates an engine with the services named in `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut engine = Self::new();
        if let Some(directory) = &config.persistence.directory {
            engine.set_persistence(FilePersistence::new(directory));
        }
        if config.debugger.enabled {
            engine.set_position_listener(LoggingPositionListener::new());
        }
        engine
    }

    /// Sets the persistence backend used by main processes.
    pub fn set_persistence(&mut self, persistence: impl Persistence + 'static) {
        self.persistence = Some(Box::new(persistence));
    }

    /// Sets the listener notified on every flow-object entry and exit.
    pub fn set_position_listener(&mut self, listener: impl PositionListener + 'static) {
        self.position_listener = Some(Box::new(listener));
    }

    /// Creates a main process instance.
    ///
    /// If a persistence backend is set, a stored record of `process_id` is
    /// loaded and the instance continues from it, including its running
    /// called processes and pending timers.
    pub fn create_process(
        &mut self,
        definition: Arc<ProcessDefinition>,
        handlers: Handlers,
        process_id: &str,
    ) -> Result<(), EngineError> {
        self.insert_main(definition, handlers, process_id)?;
        self.load(process_id)?;
        self.run()
    }

    /// Creates one main instance per collaborating definition, given as
    /// `(definition, handlers, process_id)`. Messages sent between them are
    /// delivered in memory.
    pub fn create_collaborating_processes(
        &mut self,
        processes: Vec<(Arc<ProcessDefinition>, Handlers, String)>,
    ) -> Result<Vec<String>, EngineError> {
        let mut collaborators = std::collections::BTreeMap::new();
        let mut ids = Vec::with_capacity(processes.len());

        for (definition, handlers, process_id) in processes {
            collaborators.insert(definition.bpmn_id.clone(), process_id.clone());
            self.insert_main(definition, handlers, &process_id)?;
            ids.push(process_id);
        }

        for id in &ids {
            if let Some(instance) = self.instances.get_mut(id) {
                instance.collaborators = collaborators.clone();
            }
        }
        for id in &ids {
            self.load(id)?;
        }
        self.run()?;
        Ok(ids)
    }

    /// Triggers a start event, an intermediate catch event or a boundary
    /// event. Unknown or inactive events are reported to the default event
    /// handler.
    pub fn trigger_event(
        &mut self,
        process_id: &str,
        name: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        self.submit(Signal::TriggerEvent, process_id, name, data)
    }

    /// Completes a waiting task. The task may belong to a called process of
    /// `process_id`.
    pub fn task_done(&mut self, process_id: &str, name: &str, data: Value) -> Result<(), EngineError> {
        self.submit(Signal::TaskDone, process_id, name, data)
    }

    /// Sends a message along the message flow named `name`, or leaving the
    /// flow object named `name`.
    pub fn send_message(
        &mut self,
        process_id: &str,
        name: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        self.submit(Signal::SendMessage, process_id, name, data)
    }

    /// Completes a handler that returned [`HandlerOutcome::Pending`].
    pub fn handler_done(
        &mut self,
        process_id: &str,
        name: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        self.submit(Signal::HandlerDone, process_id, name, data)
    }

    /// Dispatches every timer that has fired so far. Returns the number of
    /// timers handled.
    pub fn process_timer_events(&mut self) -> Result<usize, EngineError> {
        let mut handled = 0;
        while let Ok(fired) = self.timer_receiver.try_recv() {
            if self.accept_timer(fired) {
                handled += 1;
            }
        }
        self.run()?;
        Ok(handled)
    }

    /// Waits for the next timer and dispatches it.
    ///
    /// Returns `false` immediately if no timer is scheduled.
    pub async fn wait_for_timer_event(&mut self) -> Result<bool, EngineError> {
        if !self
            .instances
            .values()
            .any(|instance| instance.timers.has_scheduled_timeouts())
        {
            return Ok(false);
        }

        let Some(fired) = self.timer_receiver.recv().await else {
            return Ok(false);
        };
        self.accept_timer(fired);
        self.process_timer_events()?;
        Ok(true)
    }

    /// State of a process with the states of its running called processes
    /// nested as token substates.
    pub fn get_state(&self, process_id: &str) -> Result<ProcessState, EngineError> {
        self.instance(process_id)?;
        Ok(self.compose_state(process_id))
    }

    /// History of a process with running called processes nested as
    /// subhistories.
    pub fn get_history(&self, process_id: &str) -> Result<History, EngineError> {
        self.instance(process_id)?;
        Ok(self.compose_history(process_id))
    }

    pub fn get_property(&self, process_id: &str, name: &str) -> Result<Option<&Value>, EngineError> {
        Ok(self.instance(process_id)?.properties.get(name))
    }

    pub fn set_property(
        &mut self,
        process_id: &str,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), EngineError> {
        let instance = self
            .instances
            .get_mut(process_id)
            .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))?;
        instance.properties.insert(name.into(), value);
        Ok(())
    }

    pub fn is_finished(&self, process_id: &str) -> Result<bool, EngineError> {
        Ok(self.instance(process_id)?.finished)
    }

    /// True if the process or one of its called processes has a pending timer.
    pub fn has_timeouts(&self, process_id: &str) -> Result<bool, EngineError> {
        self.instance(process_id)?;
        Ok(self
            .find_instance(process_id, &|instance: &ProcessInstance| {
                instance.timers.has_timeouts()
            })
            .is_some())
    }

    /// Pending timeout of the timer event `name` in milliseconds.
    pub fn get_timeout(&self, process_id: &str, name: &str) -> Result<Option<u64>, EngineError> {
        self.instance(process_id)?;
        Ok(self
            .find_instance(process_id, &|instance: &ProcessInstance| {
                instance.timers.get_timeout(name).is_some()
            })
            .and_then(|owner| self.instances.get(&owner))
            .and_then(|instance| instance.timers.get_timeout(name)))
    }

    /// Id of the collaborating process that plays `participant`.
    ///
    /// A participant name matching more than one participant is an error.
    pub fn get_participant_process(
        &self,
        process_id: &str,
        participant: &str,
    ) -> Result<Option<&str>, EngineError> {
        let instance = self.instance(process_id)?;
        let Some(participant) = instance.definition.get_participant_by_name(participant)? else {
            return Ok(None);
        };

        let main = self.instance(&instance.main_process_id)?;
        Ok(main
            .collaborators
            .get(&participant.process_ref)
            .map(String::as_str))
    }

    pub fn get_process(&self, process_id: &str) -> Option<&ProcessInstance> {
        self.instances.get(process_id)
    }

    /// Ids of all main processes.
    pub fn process_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .instances
            .values()
            .filter(|instance| instance.is_main())
            .map(|instance| instance.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drops a process and its called processes from the engine.
    pub fn remove_process(&mut self, process_id: &str) -> bool {
        let parent = self
            .instances
            .get(process_id)
            .and_then(|instance| instance.parent.clone());

        let removed = self.terminate_process(process_id).is_some();
        if let Some(link) = parent {
            if let Some(parent) = self.instances.get_mut(&link.process_id) {
                parent.called_processes.remove(process_id);
            }
        }
        if removed {
            info!("Process '{}' removed", process_id);
        }
        removed
    }

    /// Closes the persistence backend.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.close()?;
        }
        Ok(())
    }

    fn insert_main(
        &mut self,
        definition: Arc<ProcessDefinition>,
        handlers: Handlers,
        process_id: &str,
    ) -> Result<(), EngineError> {
        if self.instances.contains_key(process_id) {
            return Err(EngineError::DuplicateProcess(process_id.to_string()));
        }

        info!(
            "Creating process '{}' from definition '{}'",
            process_id, definition.name
        );
        let instance = ProcessInstance::new(
            process_id,
            definition,
            Arc::new(handlers),
            None,
            process_id,
            self.timer_sender.clone(),
        );
        self.instances.insert(process_id.to_string(), instance);
        Ok(())
    }

    fn submit(
        &mut self,
        signal: Signal,
        process_id: &str,
        name: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        self.instance(process_id)?;
        self.raise(Job::new(signal, process_id, name, data));
        self.run()
    }

    fn instance(&self, process_id: &str) -> Result<&ProcessInstance, EngineError> {
        self.instances
            .get(process_id)
            .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))
    }

    fn definition_of(&self, process_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.instances
            .get(process_id)
            .map(|instance| Arc::clone(&instance.definition))
    }

    fn handlers_of(&self, process_id: &str) -> Option<Arc<Handlers>> {
        self.instances
            .get(process_id)
            .map(|instance| Arc::clone(&instance.handlers))
    }

    /// Depth-first search through a process and its called processes.
    fn find_instance<F>(&self, process_id: &str, predicate: &F) -> Option<String>
    where
        F: Fn(&ProcessInstance) -> bool,
    {
        let instance = self.instances.get(process_id)?;
        if predicate(instance) {
            return Some(process_id.to_string());
        }
        instance
            .called_processes
            .iter()
            .find_map(|called| self.find_instance(called, predicate))
    }

    // ---------------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------------

    fn is_deferring(&self, process_id: &str) -> bool {
        self.instances
            .get(process_id)
            .and_then(|instance| self.instances.get(&instance.main_process_id))
            .map(|main| main.deferral.deferring)
            .unwrap_or(false)
    }

    fn set_deferring(&mut self, main_id: &str, deferring: bool) {
        if let Some(main) = self.instances.get_mut(main_id) {
            main.deferral.deferring = deferring;
        }
    }

    /// Queues a job behind everything already queued.
    fn raise(&mut self, job: Job) {
        if self.is_deferring(&job.process_id) {
            let main_id = self
                .instances
                .get(&job.process_id)
                .map(|instance| instance.main_process_id.clone())
                .unwrap_or_default();
            if let Some(main) = self.instances.get_mut(&main_id) {
                debug!(
                    "[{}] Deferring {:?} '{}'",
                    job.process_id, job.signal, job.name
                );
                main.deferral.queue.push_back(job);
            }
            return;
        }
        self.queue.push_back(job);
    }

    /// Queues jobs ahead of everything else, keeping their order.
    fn raise_front(&mut self, jobs: Vec<Job>) {
        for job in jobs.into_iter().rev() {
            self.queue.push_front(job);
        }
    }

    /// Ends deferral and queues the held-back jobs for their own turn.
    fn finish_deferral(&mut self, main_id: &str) {
        let Some(main) = self.instances.get_mut(main_id) else {
            return;
        };
        main.deferral.deferring = false;

        let deferred: Vec<Job> = main.deferral.queue.drain(..).collect();
        if !deferred.is_empty() {
            debug!("[{}] Re-raising {} deferred signals", main_id, deferred.len());
        }
        self.queue.extend(deferred);
    }

    fn run(&mut self) -> Result<(), EngineError> {
        while let Some(job) = self.queue.pop_front() {
            if let Err(e) = self.dispatch(job) {
                self.queue.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, job: Job) -> Result<(), EngineError> {
        if !self.instances.contains_key(&job.process_id) {
            debug!(
                "Dropping {:?} '{}': process '{}' is gone",
                job.signal, job.name, job.process_id
            );
            return Ok(());
        }

        match job.signal {
            Signal::TokenArrived => self.token_arrived(job),
            Signal::ActivityEnd => self.activity_end(job),
            Signal::IntermediateCatch => self.intermediate_catch(job),
            Signal::BoundaryCatch => self.boundary_catch(job),
            Signal::HandlerDone => self.resolve_handler_done(job),
            Signal::TriggerEvent => self.resolve_trigger(job),
            Signal::TaskDone => self.resolve_task_done(job),
            Signal::SendMessage => self.resolve_send_message(job),
        }
    }

    fn apply_commands(&mut self, process_id: &str, commands: Vec<Command>) {
        for command in commands {
            let job = match command {
                Command::TriggerEvent { name, data } => {
                    Job::new(Signal::TriggerEvent, process_id, name, data)
                }
                Command::TaskDone { name, data } => Job::new(Signal::TaskDone, process_id, name, data),
                Command::SendMessage { name, data } => {
                    Job::new(Signal::SendMessage, process_id, name, data)
                }
                Command::HandlerDone { name, data } => {
                    Job::new(Signal::HandlerDone, process_id, name, data)
                }
            };
            self.raise(job);
        }
    }

    // ---------------------------------------------------------------------
    // Handler invocation
    // ---------------------------------------------------------------------

    /// Runs `f` with a handler context and queues the signals it raised.
    fn with_context<R>(
        &mut self,
        process_id: &str,
        flow_object_name: &str,
        f: impl FnOnce(&mut HandlerContext<'_>) -> R,
    ) -> Option<R> {
        let (result, commands) = {
            let instance = self.instances.get_mut(process_id)?;
            let mut ctx = instance.context(flow_object_name);
            let result = f(&mut ctx);
            (result, ctx.into_commands())
        };
        self.apply_commands(process_id, commands);
        Some(result)
    }

    fn invoke(&mut self, process_id: &str, name: &str, data: &Value) -> HandlerOutcome {
        let Some(handlers) = self.handlers_of(process_id) else {
            return HandlerOutcome::done();
        };

        match handlers.task(name) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                debug!("[{}] Calling handler '{}'", process_id, name);
                self.with_context(process_id, name, |ctx| handler(ctx, data))
                    .unwrap_or_else(HandlerOutcome::done)
            }
            None => {
                self.unhandled(
                    process_id,
                    EventType::TokenArrived,
                    name,
                    &handler_name(name),
                    "no handler registered",
                );
                HandlerOutcome::done()
            }
        }
    }

    /// Runs the handler of `flow_object` and emits once it is done.
    fn run_handler(
        &mut self,
        process_id: &str,
        flow_object: &FlowObject,
        data: Value,
        phase: Phase,
    ) -> Result<(), EngineError> {
        match self.invoke(process_id, &flow_object.name, &data) {
            HandlerOutcome::Done(result) => {
                self.emit(process_id, flow_object, result.unwrap_or(data))
            }
            HandlerOutcome::Pending => {
                self.await_completion(process_id, &flow_object.name, phase);
                Ok(())
            }
        }
    }

    fn await_completion(&mut self, process_id: &str, name: &str, phase: Phase) {
        debug!("[{}] Handler '{}' pending ({:?})", process_id, name, phase);
        if let Some(instance) = self.instances.get_mut(process_id) {
            instance.awaiting.push(Continuation {
                name: name.to_string(),
                phase,
            });
        }
    }

    fn evaluate_guard(
        &mut self,
        process_id: &str,
        gateway: &FlowObject,
        flow: &SequenceFlow,
        data: &Value,
    ) -> bool {
        let label = emission::flow_label(flow);
        let Some(handlers) = self.handlers_of(process_id) else {
            return false;
        };

        match handlers.guard_handler(&gateway.name, label) {
            Some(guard) => {
                let guard = Arc::clone(guard);
                let taken = self
                    .with_context(process_id, &gateway.name, |ctx| guard(ctx, data))
                    .unwrap_or(false);
                debug!(
                    "[{}] Guard '{}{}{}' -> {}",
                    process_id, gateway.name, GUARD_SEPARATOR, label, taken
                );
                taken
            }
            None => {
                self.unhandled(
                    process_id,
                    EventType::GatewayGuard,
                    &gateway.name,
                    &format!("{}{}{}", gateway.name, GUARD_SEPARATOR, label),
                    "no guard registered for outgoing flow",
                );
                false
            }
        }
    }

    /// Asks the `$getTimeout` handler of a timer event for its duration.
    fn resolve_timeout(
        &mut self,
        process_id: &str,
        flow_object: &FlowObject,
        data: &Value,
    ) -> Option<u64> {
        let handlers = self.handlers_of(process_id)?;
        let key = format!("{}{}", flow_object.name, TIMEOUT_SUFFIX);

        let Some(handler) = handlers.timeout_handler(&flow_object.name) else {
            self.report_error(process_id, &EngineError::MissingTimeoutHandler { handler: key });
            return None;
        };
        let handler = Arc::clone(handler);

        let value = self.with_context(process_id, &flow_object.name, |ctx| handler(ctx, data))?;
        match parse_timeout(&key, &value) {
            Ok(timeout) => Some(timeout),
            Err(e) => {
                self.report_error(process_id, &e);
                None
            }
        }
    }

    fn unhandled(
        &self,
        process_id: &str,
        event_type: EventType,
        name: &str,
        handler: &str,
        reason: impl Into<String>,
    ) {
        let event = UnhandledEvent {
            process_id: process_id.to_string(),
            event_type,
            flow_object_name: name.to_string(),
            handler_name: handler.to_string(),
            reason: reason.into(),
        };
        match self.instances.get(process_id) {
            Some(instance) => instance.handlers.report_event(&event),
            None => warn!("Unhandled event: {}", event),
        }
    }

    fn report_error(&self, process_id: &str, err: &EngineError) {
        match self.instances.get(process_id) {
            Some(instance) => instance.handlers.report_error(err),
            None => warn!("[{}] {}", process_id, err),
        }
    }

    fn notify_entered(&mut self, process_id: &str, name: &str) {
        if let Some(listener) = self.position_listener.as_mut() {
            if let Err(e) = listener.flow_object_entered(process_id, name) {
                warn!("Position listener failed on entering '{}': {}", name, e);
            }
        }
    }

    fn notify_left(&mut self, process_id: &str, name: &str) {
        if let Some(listener) = self.position_listener.as_mut() {
            if let Err(e) = listener.flow_object_left(process_id, name) {
                warn!("Position listener failed on leaving '{}': {}", name, e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Token movement
    // ---------------------------------------------------------------------

    fn enter(&mut self, process_id: &str, flow_object: &FlowObject, data: &Value) {
        if let Some(instance) = self.instances.get_mut(process_id) {
            instance
                .history
                .add_entry(&flow_object.name, flow_object.type_name());
        }
        debug!(
            "[{}] Token arrived at '{}' ({})",
            process_id,
            flow_object.name,
            flow_object.type_name()
        );
        self.notify_entered(process_id, &flow_object.name);
        if let Some(handlers) = self.handlers_of(process_id) {
            handlers.begin(process_id, &flow_object.name, data);
        }
    }

    /// Ends the visit of `flow_object`: stamps the history, takes its token
    /// and cancels the timers of its boundary events.
    fn leave(
        &mut self,
        process_id: &str,
        definition: &ProcessDefinition,
        flow_object: &FlowObject,
        data: &Value,
    ) {
        if let Some(instance) = self.instances.get_mut(process_id) {
            instance.history.set_end(&flow_object.name);
            instance.state.remove_token_at(&flow_object.name);
            for boundary in definition.get_boundary_events_at(flow_object) {
                instance.timers.remove_timeout(&boundary.name);
            }
        }
        debug!("[{}] Leaving '{}'", process_id, flow_object.name);
        self.notify_left(process_id, &flow_object.name);
        if let Some(handlers) = self.handlers_of(process_id) {
            handlers.end(process_id, &flow_object.name, data);
        }
    }

    fn create_token(&mut self, process_id: &str, name: &str, called_process_id: Option<String>) {
        if let Some(instance) = self.instances.get_mut(process_id) {
            instance
                .state
                .create_token_at(name, process_id, called_process_id);
        }
    }

    fn token_arrived(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;
        let Some(definition) = self.definition_of(&process_id) else {
            return Ok(());
        };
        let Some(flow_object) = definition.get_flow_object_by_name(&name) else {
            warn!("[{}] Token sent to unknown flow object '{}'", process_id, name);
            return Ok(());
        };

        match emission::arrival_rule(flow_object) {
            ArrivalRule::Run => {
                self.enter(&process_id, flow_object, &data);
                self.create_token(&process_id, &name, None);
                self.run_handler(&process_id, flow_object, data, Phase::Arrival)
            }
            ArrivalRule::WaitTask => {
                self.enter(&process_id, flow_object, &data);
                self.create_token(&process_id, &name, None);
                self.register_boundary_timers(&process_id, &definition, flow_object, &data);

                if self.invoke(&process_id, &name, &data) == HandlerOutcome::Pending {
                    self.await_completion(&process_id, &name, Phase::Arrival);
                }
                debug!("[{}] Waiting for '{}' to be done", process_id, name);
                self.save(&process_id);
                Ok(())
            }
            ArrivalRule::CatchEvent => {
                self.enter(&process_id, flow_object, &data);
                self.create_token(&process_id, &name, None);

                if flow_object.is_timer_event() {
                    if let Some(timeout) = self.resolve_timeout(&process_id, flow_object, &data) {
                        let result = match self.instances.get_mut(&process_id) {
                            Some(instance) => {
                                instance.timers.add_intermediate_timer_event(&name, timeout)
                            }
                            None => Ok(()),
                        };
                        if let Err(e) = result {
                            self.report_error(&process_id, &e);
                        }
                    }
                }
                debug!("[{}] Waiting at catch event '{}'", process_id, name);
                self.save(&process_id);
                Ok(())
            }
            ArrivalRule::Descend => {
                self.enter(&process_id, flow_object, &data);
                self.descend(&process_id, &definition, flow_object, data)
            }
        }
    }

    /// Counts the tokens parked at a parallel gateway. Returns true once the
    /// join fires; its tokens are then consumed and every visit is ended.
    fn join_fires(
        &mut self,
        process_id: &str,
        definition: &ProcessDefinition,
        gateway: &FlowObject,
    ) -> bool {
        let arrived = self
            .instances
            .get(process_id)
            .map(|instance| instance.state.number_of_tokens_at(&gateway.name))
            .unwrap_or(0);

        if !emission::join_ready(definition, gateway, arrived) {
            debug!(
                "[{}] Parallel gateway '{}' waiting ({}/{})",
                process_id,
                gateway.name,
                arrived,
                definition.distinct_incoming_count(gateway)
            );
            self.save(process_id);
            return false;
        }

        if let Some(instance) = self.instances.get_mut(process_id) {
            instance.state.remove_all_tokens_at(&gateway.name);
            instance.history.set_end_all(&gateway.name);
        }
        debug!(
            "[{}] Parallel gateway '{}' fires with {} tokens",
            process_id, gateway.name, arrived
        );
        true
    }

    /// Applies the emission rule of `flow_object` after its handler is done.
    fn emit(
        &mut self,
        process_id: &str,
        flow_object: &FlowObject,
        data: Value,
    ) -> Result<(), EngineError> {
        let Some(definition) = self.definition_of(process_id) else {
            return Ok(());
        };
        if emission::is_join(flow_object)
            && !self.join_fires(process_id, &definition, flow_object)
        {
            return Ok(());
        }

        let emission = emission::plan_emission(&definition, flow_object, &mut |flow| {
            self.evaluate_guard(process_id, flow_object, flow, &data)
        });

        match emission {
            Emission::Stall => {
                warn!(
                    "[{}] No outgoing flow of gateway '{}' has a truthy guard; the token stays",
                    process_id, flow_object.name
                );
                self.save(process_id);
            }
            Emission::Along(targets) => {
                self.leave(process_id, &definition, flow_object, &data);
                let jobs = targets
                    .into_iter()
                    .map(|target| Job::new(Signal::TokenArrived, process_id, target, data.clone()))
                    .collect();
                self.raise_front(jobs);
            }
            Emission::Finish => {
                self.leave(process_id, &definition, flow_object, &data);
                let idle = self
                    .instances
                    .get(process_id)
                    .map(|instance| !instance.state.has_tokens())
                    .unwrap_or(false);
                if idle {
                    self.complete_process(process_id, data)?;
                }
            }
        }
        Ok(())
    }

    fn register_boundary_timers(
        &mut self,
        process_id: &str,
        definition: &ProcessDefinition,
        activity: &FlowObject,
        data: &Value,
    ) {
        for boundary in definition.get_boundary_events_at(activity) {
            if !boundary.is_timer_event() {
                continue;
            }
            let Some(timeout) = self.resolve_timeout(process_id, boundary, data) else {
                continue;
            };
            let result = match self.instances.get_mut(process_id) {
                Some(instance) => instance
                    .timers
                    .add_boundary_timer_event(&boundary.name, timeout),
                None => Ok(()),
            };
            if let Err(e) = result {
                self.report_error(process_id, &e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Called processes
    // ---------------------------------------------------------------------

    fn descend(
        &mut self,
        process_id: &str,
        definition: &ProcessDefinition,
        activity: &FlowObject,
        data: Value,
    ) -> Result<(), EngineError> {
        let called = activity
            .called_definition()
            .cloned()
            .ok_or_else(|| EngineError::UnresolvedCallActivity {
                activity: activity.name.clone(),
            })?;

        let start_event = {
            let starts = called.get_start_events();
            if starts.len() != 1 {
                return Err(EngineError::StartEventCount {
                    process: called.name.clone(),
                    count: starts.len(),
                });
            }
            starts[0].name.clone()
        };

        let child_id = format!("{}{}{}", process_id, PROCESS_ID_SEPARATOR, activity.name);
        if self.instances.contains_key(&child_id) {
            return Err(EngineError::DuplicateProcess(child_id));
        }

        let Some(parent) = self.instances.get(process_id) else {
            return Ok(());
        };
        let handlers = parent.handlers.nested_for(&activity.name);
        let main_id = parent.main_process_id.clone();

        self.create_token(process_id, &activity.name, Some(child_id.clone()));
        self.register_boundary_timers(process_id, definition, activity, &data);

        info!(
            "[{}] Calling process '{}' as '{}'",
            process_id, called.name, child_id
        );
        let child = ProcessInstance::new(
            child_id.clone(),
            called,
            Arc::new(handlers),
            Some(ParentLink {
                process_id: process_id.to_string(),
                activity: activity.name.clone(),
            }),
            main_id,
            self.timer_sender.clone(),
        );
        self.instances.insert(child_id.clone(), child);
        if let Some(parent) = self.instances.get_mut(process_id) {
            parent.called_processes.insert(child_id.clone());
        }

        self.raise_front(vec![Job::new(
            Signal::TokenArrived,
            &child_id,
            start_event,
            data,
        )]);
        Ok(())
    }

    /// A process reached an end event and holds no more tokens.
    fn complete_process(&mut self, process_id: &str, data: Value) -> Result<(), EngineError> {
        let parent = {
            let Some(instance) = self.instances.get_mut(process_id) else {
                return Ok(());
            };
            instance.finished = true;
            instance.history.finished_at = Some(Utc::now());
            instance.timers.clear();
            instance.parent.clone()
        };

        match parent {
            None => {
                info!("Process '{}' finished", process_id);
                self.save(process_id);
            }
            Some(link) => {
                let Some(history) = self.terminate_process(process_id) else {
                    return Ok(());
                };
                if let Some(parent) = self.instances.get_mut(&link.process_id) {
                    parent.called_processes.remove(process_id);
                    if let Some(entry) = parent.history.last_entry_mut(&link.activity) {
                        entry.subhistory = Some(history);
                    }
                }
                info!("Called process '{}' finished", process_id);
                self.raise_front(vec![Job::new(
                    Signal::ActivityEnd,
                    &link.process_id,
                    link.activity,
                    data,
                )]);
            }
        }
        Ok(())
    }

    /// Removes a process and, recursively, its called processes. Returns
    /// its history with the called processes folded in.
    fn terminate_process(&mut self, process_id: &str) -> Option<History> {
        let called: Vec<String> = self
            .instances
            .get(process_id)?
            .called_processes
            .iter()
            .cloned()
            .collect();

        for child_id in called {
            let activity = self
                .instances
                .get(&child_id)
                .and_then(|child| child.parent.as_ref())
                .map(|link| link.activity.clone());
            let subhistory = self.terminate_process(&child_id);

            if let (Some(activity), Some(subhistory)) = (activity, subhistory) {
                if let Some(entry) = self
                    .instances
                    .get_mut(process_id)
                    .and_then(|instance| instance.history.last_entry_mut(&activity))
                {
                    entry.subhistory = Some(subhistory);
                }
            }
        }

        let mut instance = self.instances.remove(process_id)?;
        instance.timers.clear();
        Some(instance.history)
    }

    /// Cancels an active activity for an interrupting boundary event.
    fn interrupt(
        &mut self,
        process_id: &str,
        definition: &ProcessDefinition,
        activity: &FlowObject,
        data: &Value,
    ) {
        let called = self
            .instances
            .get(process_id)
            .and_then(|instance| instance.state.first_token_at(&activity.name))
            .and_then(|token| token.called_process_id.clone());

        if let Some(child_id) = called {
            if let Some(subhistory) = self.terminate_process(&child_id) {
                info!("[{}] Called process '{}' terminated", process_id, child_id);
                if let Some(parent) = self.instances.get_mut(process_id) {
                    parent.called_processes.remove(&child_id);
                    if let Some(entry) = parent.history.last_entry_mut(&activity.name) {
                        entry.subhistory = Some(subhistory);
                    }
                }
            }
        }

        if let Some(instance) = self.instances.get_mut(process_id) {
            instance.take_continuation(&activity.name);
            for boundary in definition.get_boundary_events_at(activity) {
                instance.timers.remove_timeout(&boundary.name);
            }
            instance.state.remove_token_at(&activity.name);
            instance.history.set_end(&activity.name);
        }
        self.notify_left(process_id, &activity.name);
        if let Some(handlers) = self.handlers_of(process_id) {
            handlers.end(process_id, &activity.name, data);
        }
    }

    // ---------------------------------------------------------------------
    // Signals
    // ---------------------------------------------------------------------

    fn activity_end(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;
        let Some(definition) = self.definition_of(&process_id) else {
            return Ok(());
        };
        let Some(flow_object) = definition.get_flow_object_by_name(&name) else {
            return Ok(());
        };

        let active = self
            .instances
            .get(&process_id)
            .map(|instance| instance.state.has_tokens_at(&name))
            .unwrap_or(false);
        if !active {
            self.unhandled(
                &process_id,
                EventType::ActivityEnd,
                &name,
                &name,
                "activity is not active",
            );
            return Ok(());
        }

        if flow_object.is_wait_task() {
            if let Some(instance) = self.instances.get_mut(&process_id) {
                instance.take_continuation(&name);
            }

            let done_handler = self
                .handlers_of(&process_id)
                .and_then(|handlers| handlers.done_handler(&name).cloned());
            if let Some(handler) = done_handler {
                let outcome = self
                    .with_context(&process_id, &name, |ctx| handler(ctx, &data))
                    .unwrap_or_else(HandlerOutcome::done);
                return match outcome {
                    HandlerOutcome::Done(result) => {
                        self.emit(&process_id, flow_object, result.unwrap_or(data))
                    }
                    HandlerOutcome::Pending => {
                        self.await_completion(&process_id, &name, Phase::Completion);
                        Ok(())
                    }
                };
            }
        }

        self.emit(&process_id, flow_object, data)
    }

    fn intermediate_catch(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;

        let owner = self.find_instance(&process_id, &|instance: &ProcessInstance| {
            instance.state.has_tokens_at(&name)
                && !instance.is_awaiting(&name)
                && instance
                    .definition
                    .get_flow_object_by_name(&name)
                    .map(|fo| fo.is_intermediate_catch_event())
                    .unwrap_or(false)
        });
        let Some(owner) = owner else {
            self.unhandled(
                &process_id,
                EventType::IntermediateCatch,
                &name,
                &name,
                "no token is waiting at this event",
            );
            return Ok(());
        };

        let Some(definition) = self.definition_of(&owner) else {
            return Ok(());
        };
        let Some(flow_object) = definition.get_flow_object_by_name(&name) else {
            return Ok(());
        };

        if let Some(instance) = self.instances.get_mut(&owner) {
            instance.timers.remove_timeout(&name);
        }
        debug!("[{}] Intermediate event '{}' caught", owner, name);
        self.run_handler(&owner, flow_object, data, Phase::Catch)
    }

    fn boundary_catch(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;

        let owner = self.find_instance(&process_id, &|instance: &ProcessInstance| {
            instance
                .definition
                .get_flow_object_by_name(&name)
                .and_then(|boundary| boundary.attached_to_ref())
                .and_then(|attached| instance.definition.get_flow_object(attached))
                .map(|activity| instance.state.has_tokens_at(&activity.name))
                .unwrap_or(false)
        });
        let Some(owner) = owner else {
            self.unhandled(
                &process_id,
                EventType::BoundaryCatch,
                &name,
                &name,
                "the activity this event is attached to is not active",
            );
            return Ok(());
        };

        let Some(definition) = self.definition_of(&owner) else {
            return Ok(());
        };
        let Some(boundary) = definition.get_flow_object_by_name(&name) else {
            return Ok(());
        };
        let Some(activity) = boundary
            .attached_to_ref()
            .and_then(|attached| definition.get_flow_object(attached))
        else {
            return Ok(());
        };

        if let Some(instance) = self.instances.get_mut(&owner) {
            instance.timers.remove_timeout(&name);
        }

        if boundary.cancels_activity() {
            info!(
                "[{}] Boundary event '{}' interrupts '{}'",
                owner, name, activity.name
            );
            self.interrupt(&owner, &definition, activity, &data);
        } else {
            debug!(
                "[{}] Boundary event '{}' fires, '{}' continues",
                owner, name, activity.name
            );
        }

        self.raise_front(vec![Job::new(Signal::TokenArrived, &owner, name, data)]);
        Ok(())
    }

    fn resolve_handler_done(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;

        let owner = self.find_instance(&process_id, &|instance: &ProcessInstance| {
            instance.is_awaiting(&name)
        });
        let Some(owner) = owner else {
            self.unhandled(
                &process_id,
                EventType::HandlerDone,
                &name,
                &name,
                "no handler is waiting for completion",
            );
            return Ok(());
        };

        let phase = self
            .instances
            .get_mut(&owner)
            .and_then(|instance| instance.take_continuation(&name));
        let Some(definition) = self.definition_of(&owner) else {
            return Ok(());
        };
        let Some(flow_object) = definition.get_flow_object_by_name(&name) else {
            return Ok(());
        };

        match phase {
            Some(Phase::Arrival)
                if emission::arrival_rule(flow_object) == ArrivalRule::WaitTask =>
            {
                debug!("[{}] Handler of '{}' done, task still waiting", owner, name);
                Ok(())
            }
            _ => self.emit(&owner, flow_object, data),
        }
    }

    fn resolve_task_done(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;
        let handler = format!("{}{}", name, DONE_SUFFIX);

        let owner = self.find_instance(&process_id, &|instance: &ProcessInstance| {
            instance.state.has_tokens_at(&name)
        });
        let Some(owner) = owner else {
            self.unhandled(
                &process_id,
                EventType::ActivityEnd,
                &name,
                &handler,
                "activity is not active",
            );
            return Ok(());
        };

        let is_wait_task = self
            .definition_of(&owner)
            .and_then(|definition| {
                definition
                    .get_flow_object_by_name(&name)
                    .map(|fo| fo.is_wait_task())
            })
            .unwrap_or(false);
        if !is_wait_task {
            self.unhandled(
                &owner,
                EventType::ActivityEnd,
                &name,
                &handler,
                "flow object is not a wait task",
            );
            return Ok(());
        }

        self.activity_end(Job::new(Signal::ActivityEnd, &owner, name, data))
    }

    fn resolve_trigger(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;

        let owner = self.find_instance(&process_id, &|instance: &ProcessInstance| {
            instance.definition.has_flow_object(&name)
        });
        let Some(owner) = owner else {
            self.unhandled(
                &process_id,
                EventType::TriggerEvent,
                &name,
                &name,
                "no flow object with this name",
            );
            return Ok(());
        };
        let Some(definition) = self.definition_of(&owner) else {
            return Ok(());
        };
        let Some(flow_object) = definition.get_flow_object_by_name(&name) else {
            return Ok(());
        };

        if flow_object.is_start_event() {
            if owner != process_id {
                self.unhandled(
                    &process_id,
                    EventType::TriggerEvent,
                    &name,
                    &name,
                    "start events of called processes are started by their call activity",
                );
                return Ok(());
            }
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.finished = false;
            }
            self.token_arrived(Job::new(Signal::TokenArrived, &owner, name, data))
        } else if flow_object.is_intermediate_catch_event() {
            self.intermediate_catch(Job::new(Signal::IntermediateCatch, &process_id, name, data))
        } else if flow_object.is_boundary_event() {
            self.boundary_catch(Job::new(Signal::BoundaryCatch, &process_id, name, data))
        } else {
            let reason = format!("a {} cannot be triggered", flow_object.type_name());
            self.unhandled(&process_id, EventType::TriggerEvent, &name, &name, reason);
            Ok(())
        }
    }

    fn resolve_send_message(&mut self, job: Job) -> Result<(), EngineError> {
        let Job {
            process_id,
            name,
            data,
            ..
        } = job;
        let Some(instance) = self.instances.get(&process_id) else {
            return Ok(());
        };

        let Some(flow) = instance.definition.get_message_flow(&name).cloned() else {
            self.unhandled(
                &process_id,
                EventType::SendMessage,
                &name,
                &name,
                "no message flow with this name or source",
            );
            return Ok(());
        };

        let target_process = flow
            .target_process_definition_id
            .as_ref()
            .and_then(|definition_id| {
                self.instances
                    .get(&instance.main_process_id)
                    .and_then(|main| main.collaborators.get(definition_id))
            })
            .cloned();
        let Some(target_process) = target_process else {
            let reason = format!("no collaborating process receives message flow '{}'", flow.bpmn_id);
            self.unhandled(&process_id, EventType::SendMessage, &name, &name, reason);
            return Ok(());
        };

        let target_name = self
            .instances
            .get(&target_process)
            .and_then(|target| target.definition.get_flow_object(&flow.target_ref))
            .map(|fo| fo.name.clone());
        let Some(target_name) = target_name else {
            self.unhandled(
                &process_id,
                EventType::SendMessage,
                &name,
                &name,
                "the target of the message flow does not exist",
            );
            return Ok(());
        };

        info!(
            "[{}] Message '{}' delivered to '{}' in '{}'",
            process_id, name, target_name, target_process
        );
        self.resolve_trigger(Job::new(
            Signal::TriggerEvent,
            &target_process,
            target_name,
            data,
        ))
    }

    fn accept_timer(&mut self, fired: TimerFired) -> bool {
        let Some(instance) = self.instances.get_mut(&fired.process_id) else {
            return false;
        };
        if !instance.timers.take_fired(&fired) {
            debug!("[{}] Ignoring stale timer '{}'", fired.process_id, fired.name);
            return false;
        }

        debug!("[{}] Timer '{}' fired", fired.process_id, fired.name);
        let signal = match fired.kind {
            TimerKind::Boundary => Signal::BoundaryCatch,
            TimerKind::Intermediate => Signal::IntermediateCatch,
        };
        self.raise(Job::new(signal, &fired.process_id, fired.name, Value::Null));
        true
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    fn compose_state(&self, process_id: &str) -> ProcessState {
        let Some(instance) = self.instances.get(process_id) else {
            return ProcessState::new();
        };
        let mut state = instance.state.clone();
        for token in state.tokens.iter_mut() {
            if let Some(called) = &token.called_process_id {
                if self.instances.contains_key(called) {
                    token.substate = Some(self.compose_state(called));
                }
            }
        }
        state
    }

    fn compose_history(&self, process_id: &str) -> History {
        let Some(instance) = self.instances.get(process_id) else {
            return History::new();
        };
        let mut history = instance.history.clone();
        for child_id in &instance.called_processes {
            let Some(link) = self.instances.get(child_id).and_then(|c| c.parent.as_ref()) else {
                continue;
            };
            if let Some(entry) = history.last_entry_mut(&link.activity) {
                entry.subhistory = Some(self.compose_history(child_id));
            }
        }
        history
    }

    fn compose_record(&self, main_id: &str) -> Option<PersistedRecord> {
        let instance = self.instances.get(main_id)?;
        let history = self.compose_history(main_id);
        Some(PersistedRecord {
            process_name: instance.definition.name.clone(),
            process_id: main_id.to_string(),
            parent_token: None,
            properties: instance.properties.clone(),
            state: self.compose_state(main_id),
            views: Views::from_history(&history),
            history,
            pending_timeouts: self.compose_timeouts(main_id),
        })
    }

    /// Pending timeouts of a main process and its called processes. Timeouts
    /// of a called process are keyed by `<called process id>::<event name>`.
    fn compose_timeouts(&self, main_id: &str) -> BTreeMap<String, PersistedTimeout> {
        let mut timeouts = BTreeMap::new();
        for (id, instance) in &self.instances {
            if instance.main_process_id != main_id {
                continue;
            }
            for (name, timeout) in instance.timers.pending_timeouts() {
                let key = if id == main_id {
                    name
                } else {
                    format!("{}{}{}", id, PROCESS_ID_SEPARATOR, name)
                };
                timeouts.insert(key, timeout);
            }
        }
        timeouts
    }

    /// Splits a persisted timeout key into its owning instance and event
    /// name. The longest matching called process id wins.
    fn timeout_owner(&self, main_id: &str, key: &str) -> (String, String) {
        self.instances
            .iter()
            .filter(|(id, instance)| id.as_str() != main_id && instance.main_process_id == main_id)
            .filter_map(|(id, _)| {
                let name = key
                    .strip_prefix(id.as_str())?
                    .strip_prefix(PROCESS_ID_SEPARATOR)?;
                Some((id, name))
            })
            .max_by_key(|(id, _)| id.len())
            .map(|(id, name)| (id.clone(), name.to_string()))
            .unwrap_or_else(|| (main_id.to_string(), key.to_string()))
    }

    fn restore_timeouts(&mut self, main_id: &str, pending: &BTreeMap<String, PersistedTimeout>) {
        let mut by_owner: HashMap<String, BTreeMap<String, PersistedTimeout>> = HashMap::new();
        for (key, timeout) in pending {
            let (owner, name) = self.timeout_owner(main_id, key);
            by_owner.entry(owner).or_default().insert(name, *timeout);
        }

        for (owner, timeouts) in by_owner {
            let errors = match self.instances.get_mut(&owner) {
                Some(instance) => {
                    let definition = Arc::clone(&instance.definition);
                    instance.timers.restore_timer_events(&timeouts, &definition)
                }
                None => Vec::new(),
            };
            for e in &errors {
                self.report_error(&owner, e);
            }
        }
    }

    /// Persists the main process of `process_id`.
    fn save(&mut self, process_id: &str) {
        if self.persistence.is_none() {
            return;
        }
        let Some(main_id) = self
            .instances
            .get(process_id)
            .map(|instance| instance.main_process_id.clone())
        else {
            return;
        };
        let Some(record) = self.compose_record(&main_id) else {
            return;
        };

        self.set_deferring(&main_id, true);
        let result = match self.persistence.as_mut() {
            Some(persistence) => persistence.persist(&record),
            None => Err(PersistenceError::Closed),
        };
        if result.is_ok() {
            debug!("[{}] Saved ({} tokens)", main_id, record.state.tokens.len());
        }

        let hook = self
            .handlers_of(&main_id)
            .and_then(|handlers| handlers.saved_handler().cloned());
        if let Some(hook) = hook {
            self.with_context(&main_id, "", |ctx| hook(ctx, result.as_ref()));
        }
        if let Err(e) = result {
            self.report_error(&main_id, &EngineError::Persistence(e));
        }
        self.finish_deferral(&main_id);
    }

    /// Loads the stored record of a main process, if any.
    fn load(&mut self, main_id: &str) -> Result<(), EngineError> {
        if self.persistence.is_none() {
            return Ok(());
        }
        let Some(process_name) = self
            .instances
            .get(main_id)
            .map(|instance| instance.definition.name.clone())
        else {
            return Ok(());
        };

        self.set_deferring(main_id, true);
        let result = match self.persistence.as_mut() {
            Some(persistence) => persistence.load(main_id, &process_name),
            None => Err(PersistenceError::Closed),
        };

        let restored = match &result {
            Ok(Some(record)) => self.restore(main_id, record.clone()),
            Ok(None) => {
                debug!("[{}] No stored record, starting fresh", main_id);
                Ok(())
            }
            Err(_) => Ok(()),
        };

        let hook = self
            .handlers_of(main_id)
            .and_then(|handlers| handlers.loaded_handler().cloned());
        if let Some(hook) = hook {
            self.with_context(main_id, "", |ctx| hook(ctx, result.as_ref().map(Option::as_ref)));
        }
        if let Err(e) = result {
            self.report_error(main_id, &EngineError::Persistence(e));
        }
        self.finish_deferral(main_id);
        restored
    }

    fn restore(&mut self, main_id: &str, record: PersistedRecord) -> Result<(), EngineError> {
        {
            let Some(instance) = self.instances.get_mut(main_id) else {
                return Ok(());
            };
            instance.properties = record.properties;
            instance.state = record.state;
            instance.history = record.history;
            instance.finished = instance.history.is_finished() && !instance.state.has_tokens();
        }

        self.rebuild_called_processes(main_id)?;
        self.restore_timeouts(main_id, &record.pending_timeouts);
        info!(
            "Process '{}' restored with {} tokens",
            main_id,
            self.compose_state(main_id).tokens.len()
        );
        Ok(())
    }

    /// Re-creates called processes from the substates of call-activity
    /// tokens and the subhistories of their open history entries.
    fn rebuild_called_processes(&mut self, process_id: &str) -> Result<(), EngineError> {
        let Some(parent) = self.instances.get_mut(process_id) else {
            return Ok(());
        };
        let definition = Arc::clone(&parent.definition);
        let handlers = Arc::clone(&parent.handlers);
        let main_id = parent.main_process_id.clone();

        let mut children = Vec::new();
        for token in parent.state.tokens.iter_mut() {
            let (Some(child_id), Some(substate)) =
                (token.called_process_id.clone(), token.substate.take())
            else {
                continue;
            };
            let subhistory = parent
                .history
                .last_entry_mut(&token.position)
                .and_then(|entry| entry.subhistory.take())
                .unwrap_or_default();
            children.push((token.position.clone(), child_id, substate, subhistory));
        }

        for (activity, child_id, substate, subhistory) in children {
            let called = definition
                .get_flow_object_by_name(&activity)
                .and_then(|fo| fo.called_definition().cloned())
                .ok_or_else(|| EngineError::UnresolvedCallActivity {
                    activity: activity.clone(),
                })?;

            let mut child = ProcessInstance::new(
                child_id.clone(),
                called,
                Arc::new(handlers.nested_for(&activity)),
                Some(ParentLink {
                    process_id: process_id.to_string(),
                    activity,
                }),
                main_id.clone(),
                self.timer_sender.clone(),
            );
            child.state = substate;
            child.history = subhistory;

            debug!("[{}] Restored called process '{}'", process_id, child_id);
            self.instances.insert(child_id.clone(), child);
            if let Some(parent) = self.instances.get_mut(process_id) {
                parent.called_processes.insert(child_id.clone());
            }
            self.rebuild_called_processes(&child_id)?;
        }
        Ok(())
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}
