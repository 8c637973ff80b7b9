//! Process Definition Model
//!
//! Immutable-after-build graph of flow objects, sequence flows and message
//! flows. Lookup indices are built lazily on first use and dropped whenever
//! the graph is mutated.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: order_process
//! name: Order Process
//! flowObjects:
//!   - id: start
//!     name: Start
//!     type: startEvent
//!   - id: review
//!     name: Review Order
//!     type: task
//!     taskType: userTask
//!   - id: end
//!     name: End
//!     type: endEvent
//! sequenceFlows:
//!   - id: f1
//!     sourceRef: start
//!     targetRef: review
//!   - id: f2
//!     sourceRef: review
//!     targetRef: end
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Kind of event trigger attached to an event flow object.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EventDefinition {
    #[default]
    None,
    Timer,
    Message,
}

/// Concrete BPMN task flavour.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    #[default]
    Task,
    ServiceTask,
    ScriptTask,
    SendTask,
    BusinessRuleTask,
    UserTask,
    ReceiveTask,
    ManualTask,
}

impl TaskType {
    /// Wait tasks park their token until `task_done` is signaled.
    pub fn is_wait_task(self) -> bool {
        matches!(
            self,
            Self::Task | Self::UserTask | Self::ReceiveTask | Self::ManualTask
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::ServiceTask => "serviceTask",
            Self::ScriptTask => "scriptTask",
            Self::SendTask => "sendTask",
            Self::BusinessRuleTask => "businessRuleTask",
            Self::UserTask => "userTask",
            Self::ReceiveTask => "receiveTask",
            Self::ManualTask => "manualTask",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Variant part of a flow object. The variant decides the token-emission
/// rule applied by the engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowObjectKind {
    #[serde(rename_all = "camelCase")]
    StartEvent {
        #[serde(default)]
        event_definition: EventDefinition,
    },
    EndEvent,
    #[serde(rename_all = "camelCase")]
    Task {
        #[serde(default)]
        task_type: TaskType,
    },
    ExclusiveGateway,
    ParallelGateway,
    #[serde(rename_all = "camelCase")]
    BoundaryEvent {
        attached_to_ref: String,
        #[serde(default)]
        event_definition: EventDefinition,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
    #[serde(rename_all = "camelCase")]
    IntermediateCatchEvent {
        #[serde(default)]
        event_definition: EventDefinition,
    },
    #[serde(rename_all = "camelCase")]
    IntermediateThrowEvent {
        #[serde(default)]
        event_definition: EventDefinition,
    },
    #[serde(rename_all = "camelCase")]
    CallActivity {
        /// Location of the called definition, relative to the calling file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        called_element: Option<String>,
        /// Resolved called definition (filled in by the loader or builder).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<Arc<ProcessDefinition>>,
    },
    SubProcess {
        #[serde(rename = "process")]
        definition: Arc<ProcessDefinition>,
    },
}

/// A node of the process graph.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlowObject {
    #[serde(rename = "id")]
    pub bpmn_id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: FlowObjectKind,
}

impl FlowObject {
    pub fn new(bpmn_id: impl Into<String>, name: impl Into<String>, kind: FlowObjectKind) -> Self {
        Self {
            bpmn_id: bpmn_id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            kind,
        }
    }

    pub fn start_event(bpmn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            bpmn_id,
            name,
            FlowObjectKind::StartEvent {
                event_definition: EventDefinition::None,
            },
        )
    }

    pub fn end_event(bpmn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(bpmn_id, name, FlowObjectKind::EndEvent)
    }

    pub fn task(bpmn_id: impl Into<String>, name: impl Into<String>, task_type: TaskType) -> Self {
        Self::new(bpmn_id, name, FlowObjectKind::Task { task_type })
    }

    pub fn exclusive_gateway(bpmn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(bpmn_id, name, FlowObjectKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(bpmn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(bpmn_id, name, FlowObjectKind::ParallelGateway)
    }

    pub fn boundary_event(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        attached_to_ref: impl Into<String>,
        event_definition: EventDefinition,
    ) -> Self {
        Self::new(
            bpmn_id,
            name,
            FlowObjectKind::BoundaryEvent {
                attached_to_ref: attached_to_ref.into(),
                event_definition,
                cancel_activity: true,
            },
        )
    }

    pub fn intermediate_catch_event(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        event_definition: EventDefinition,
    ) -> Self {
        Self::new(
            bpmn_id,
            name,
            FlowObjectKind::IntermediateCatchEvent { event_definition },
        )
    }

    pub fn call_activity(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        definition: Arc<ProcessDefinition>,
    ) -> Self {
        Self::new(
            bpmn_id,
            name,
            FlowObjectKind::CallActivity {
                called_element: None,
                definition: Some(definition),
            },
        )
    }

    pub fn sub_process(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        definition: Arc<ProcessDefinition>,
    ) -> Self {
        Self::new(bpmn_id, name, FlowObjectKind::SubProcess { definition })
    }

    /// BPMN element type name as recorded in the history.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            FlowObjectKind::StartEvent { .. } => "startEvent",
            FlowObjectKind::EndEvent => "endEvent",
            FlowObjectKind::Task { task_type } => task_type.as_str(),
            FlowObjectKind::ExclusiveGateway => "exclusiveGateway",
            FlowObjectKind::ParallelGateway => "parallelGateway",
            FlowObjectKind::BoundaryEvent { .. } => "boundaryEvent",
            FlowObjectKind::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            FlowObjectKind::IntermediateThrowEvent { .. } => "intermediateThrowEvent",
            FlowObjectKind::CallActivity { .. } => "callActivity",
            FlowObjectKind::SubProcess { .. } => "subProcess",
        }
    }

    pub fn is_start_event(&self) -> bool {
        matches!(self.kind, FlowObjectKind::StartEvent { .. })
    }

    pub fn is_end_event(&self) -> bool {
        matches!(self.kind, FlowObjectKind::EndEvent)
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(self.kind, FlowObjectKind::BoundaryEvent { .. })
    }

    pub fn is_intermediate_catch_event(&self) -> bool {
        matches!(self.kind, FlowObjectKind::IntermediateCatchEvent { .. })
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self.kind,
            FlowObjectKind::ExclusiveGateway | FlowObjectKind::ParallelGateway
        )
    }

    /// Call activities and sub-processes both spawn a nested process instance.
    pub fn is_call_activity(&self) -> bool {
        matches!(
            self.kind,
            FlowObjectKind::CallActivity { .. } | FlowObjectKind::SubProcess { .. }
        )
    }

    pub fn is_wait_task(&self) -> bool {
        matches!(self.kind, FlowObjectKind::Task { task_type } if task_type.is_wait_task())
    }

    /// Activities that can carry boundary events.
    pub fn is_wait_activity(&self) -> bool {
        self.is_wait_task() || self.is_call_activity()
    }

    pub fn is_timer_event(&self) -> bool {
        self.event_definition() == Some(EventDefinition::Timer)
    }

    pub fn event_definition(&self) -> Option<EventDefinition> {
        match &self.kind {
            FlowObjectKind::StartEvent { event_definition }
            | FlowObjectKind::BoundaryEvent {
                event_definition, ..
            }
            | FlowObjectKind::IntermediateCatchEvent { event_definition }
            | FlowObjectKind::IntermediateThrowEvent { event_definition } => {
                Some(*event_definition)
            }
            _ => None,
        }
    }

    pub fn attached_to_ref(&self) -> Option<&str> {
        match &self.kind {
            FlowObjectKind::BoundaryEvent {
                attached_to_ref, ..
            } => Some(attached_to_ref),
            _ => None,
        }
    }

    /// Returns false only for non-interrupting boundary events.
    pub fn cancels_activity(&self) -> bool {
        match &self.kind {
            FlowObjectKind::BoundaryEvent {
                cancel_activity, ..
            } => *cancel_activity,
            _ => true,
        }
    }

    /// Definition executed by a call activity or sub-process.
    pub fn called_definition(&self) -> Option<&Arc<ProcessDefinition>> {
        match &self.kind {
            FlowObjectKind::CallActivity { definition, .. } => definition.as_ref(),
            FlowObjectKind::SubProcess { definition } => Some(definition),
            _ => None,
        }
    }
}

/// Directed edge between two flow objects of the same definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequenceFlow {
    #[serde(rename = "id")]
    pub bpmn_id: String,
    #[serde(default)]
    pub name: String,
    pub source_ref: String,
    pub target_ref: String,
}

impl SequenceFlow {
    pub fn new(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
    ) -> Self {
        Self {
            bpmn_id: bpmn_id.into(),
            name: name.into(),
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
        }
    }
}

/// Edge between flow objects of two collaborating participants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageFlow {
    #[serde(rename = "id")]
    pub bpmn_id: String,
    #[serde(default)]
    pub name: String,
    pub source_ref: String,
    pub target_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_process_definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_process_definition_id: Option<String>,
}

impl MessageFlow {
    pub fn new(
        bpmn_id: impl Into<String>,
        name: impl Into<String>,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
    ) -> Self {
        Self {
            bpmn_id: bpmn_id.into(),
            name: name.into(),
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            source_process_definition_id: None,
            target_process_definition_id: None,
        }
    }
}

/// A collaboration participant backed by a process definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    pub process_ref: String,
}

#[derive(Debug, Clone, Default)]
struct Indices {
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    outgoing_by_source: HashMap<String, Vec<usize>>,
    incoming_by_target: HashMap<String, Vec<usize>>,
    boundary_by_attachment: HashMap<String, Vec<usize>>,
}

/// A complete process graph.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    #[serde(rename = "id")]
    pub bpmn_id: String,
    pub name: String,

    #[serde(default)]
    flow_objects: Vec<FlowObject>,

    #[serde(default)]
    sequence_flows: Vec<SequenceFlow>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    message_flows: Vec<MessageFlow>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    collaborating_participants: Vec<Participant>,

    #[serde(skip)]
    indices: OnceCell<Indices>,
}

impl ProcessDefinition {
    pub fn new(bpmn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bpmn_id: bpmn_id.into(),
            name: name.into(),
            flow_objects: Vec::new(),
            sequence_flows: Vec::new(),
            message_flows: Vec::new(),
            collaborating_participants: Vec::new(),
            indices: OnceCell::new(),
        }
    }

    pub fn add_flow_object(&mut self, flow_object: FlowObject) {
        self.flow_objects.push(flow_object);
        self.indices = OnceCell::new();
    }

    pub fn add_sequence_flow(&mut self, sequence_flow: SequenceFlow) {
        self.sequence_flows.push(sequence_flow);
        self.indices = OnceCell::new();
    }

    pub(crate) fn set_collaboration(
        &mut self,
        participants: Vec<Participant>,
        message_flows: Vec<MessageFlow>,
    ) {
        self.collaborating_participants = participants;
        self.message_flows = message_flows;
    }

    pub(crate) fn flow_objects_mut(&mut self) -> impl Iterator<Item = &mut FlowObject> {
        self.indices = OnceCell::new();
        self.flow_objects.iter_mut()
    }

    pub fn flow_objects(&self) -> &[FlowObject] {
        &self.flow_objects
    }

    pub fn sequence_flows(&self) -> &[SequenceFlow] {
        &self.sequence_flows
    }

    pub fn message_flows(&self) -> &[MessageFlow] {
        &self.message_flows
    }

    pub fn participants(&self) -> &[Participant] {
        &self.collaborating_participants
    }

    fn indices(&self) -> &Indices {
        self.indices.get_or_init(|| {
            let mut indices = Indices::default();

            for (i, flow_object) in self.flow_objects.iter().enumerate() {
                indices.by_id.entry(flow_object.bpmn_id.clone()).or_insert(i);
                indices.by_name.entry(flow_object.name.clone()).or_insert(i);

                if let Some(attached) = flow_object.attached_to_ref() {
                    indices
                        .boundary_by_attachment
                        .entry(attached.to_string())
                        .or_default()
                        .push(i);
                }
            }

            for (i, flow) in self.sequence_flows.iter().enumerate() {
                indices
                    .outgoing_by_source
                    .entry(flow.source_ref.clone())
                    .or_default()
                    .push(i);
                indices
                    .incoming_by_target
                    .entry(flow.target_ref.clone())
                    .or_default()
                    .push(i);
            }

            indices
        })
    }

    pub fn get_flow_object(&self, bpmn_id: &str) -> Option<&FlowObject> {
        self.indices()
            .by_id
            .get(bpmn_id)
            .map(|&i| &self.flow_objects[i])
    }

    /// Names are unique within a valid definition; see the validator.
    pub fn get_flow_object_by_name(&self, name: &str) -> Option<&FlowObject> {
        self.indices()
            .by_name
            .get(name)
            .map(|&i| &self.flow_objects[i])
    }

    pub fn has_flow_object(&self, name: &str) -> bool {
        self.indices().by_name.contains_key(name)
    }

    pub fn get_outgoing_sequence_flows(&self, flow_object: &FlowObject) -> Vec<&SequenceFlow> {
        self.indices()
            .outgoing_by_source
            .get(&flow_object.bpmn_id)
            .map(|flows| flows.iter().map(|&i| &self.sequence_flows[i]).collect())
            .unwrap_or_default()
    }

    pub fn get_incoming_sequence_flows(&self, flow_object: &FlowObject) -> Vec<&SequenceFlow> {
        self.indices()
            .incoming_by_target
            .get(&flow_object.bpmn_id)
            .map(|flows| flows.iter().map(|&i| &self.sequence_flows[i]).collect())
            .unwrap_or_default()
    }

    /// Number of distinct incoming sequence flows (parallel join threshold).
    pub fn distinct_incoming_count(&self, flow_object: &FlowObject) -> usize {
        let mut ids: Vec<&str> = self
            .get_incoming_sequence_flows(flow_object)
            .into_iter()
            .map(|f| f.bpmn_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn get_boundary_events_at(&self, activity: &FlowObject) -> Vec<&FlowObject> {
        self.indices()
            .boundary_by_attachment
            .get(&activity.bpmn_id)
            .map(|events| events.iter().map(|&i| &self.flow_objects[i]).collect())
            .unwrap_or_default()
    }

    /// Immediate successors in sequence-flow declaration order.
    pub fn get_next_flow_objects(&self, flow_object: &FlowObject) -> Vec<&FlowObject> {
        self.get_outgoing_sequence_flows(flow_object)
            .into_iter()
            .filter_map(|flow| self.get_flow_object(&flow.target_ref))
            .collect()
    }

    pub fn get_start_events(&self) -> Vec<&FlowObject> {
        self.flow_objects
            .iter()
            .filter(|fo| fo.is_start_event())
            .collect()
    }

    /// Finds a message flow by its own name, or by the name of its source
    /// flow object.
    pub fn get_message_flow(&self, name: &str) -> Option<&MessageFlow> {
        self.message_flows
            .iter()
            .find(|mf| !mf.name.is_empty() && mf.name == name)
            .or_else(|| {
                let source = self.get_flow_object_by_name(name)?;
                self.message_flows
                    .iter()
                    .find(|mf| mf.source_ref == source.bpmn_id)
            })
    }

    /// Looks up a collaboration participant by name.
    ///
    /// More than one match means the collaboration itself is inconsistent
    /// and is reported as an error.
    pub fn get_participant_by_name(
        &self,
        name: &str,
    ) -> Result<Option<&Participant>, DefinitionError> {
        let matches: Vec<&Participant> = self
            .collaborating_participants
            .iter()
            .filter(|p| p.name == name)
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            count => Err(DefinitionError::AmbiguousParticipant {
                name: name.to_string(),
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("p1", "Test Process");
        def.add_flow_object(FlowObject::start_event("s", "Start"));
        def.add_flow_object(FlowObject::task("t", "Review", TaskType::UserTask));
        def.add_flow_object(FlowObject::boundary_event(
            "b",
            "Review Timeout",
            "t",
            EventDefinition::Timer,
        ));
        def.add_flow_object(FlowObject::end_event("e", "End"));
        def.add_flow_object(FlowObject::end_event("e2", "Timed Out"));
        def.add_sequence_flow(SequenceFlow::new("f1", "", "s", "t"));
        def.add_sequence_flow(SequenceFlow::new("f2", "", "t", "e"));
        def.add_sequence_flow(SequenceFlow::new("f3", "", "b", "e2"));
        def
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let def = create_test_definition();
        assert_eq!(def.get_flow_object("t").unwrap().name, "Review");
        assert_eq!(def.get_flow_object_by_name("Review").unwrap().bpmn_id, "t");
        assert!(def.get_flow_object("missing").is_none());
        assert!(def.has_flow_object("End"));
    }

    #[test]
    fn test_outgoing_and_incoming_flows() {
        let def = create_test_definition();
        let task = def.get_flow_object("t").unwrap();

        let outgoing = def.get_outgoing_sequence_flows(task);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target_ref, "e");

        let incoming = def.get_incoming_sequence_flows(task);
        assert_eq!(incoming.len(), 1);
        assert_eq!(def.distinct_incoming_count(task), 1);
    }

    #[test]
    fn test_boundary_events_and_successors() {
        let def = create_test_definition();
        let task = def.get_flow_object("t").unwrap();

        let boundary = def.get_boundary_events_at(task);
        assert_eq!(boundary.len(), 1);
        assert_eq!(boundary[0].name, "Review Timeout");
        assert!(boundary[0].is_timer_event());

        let next: Vec<&str> = def
            .get_next_flow_objects(task)
            .iter()
            .map(|fo| fo.name.as_str())
            .collect();
        assert_eq!(next, vec!["End"]);
    }

    #[test]
    fn test_mutation_invalidates_indices() {
        let mut def = create_test_definition();
        assert!(def.get_flow_object_by_name("Extra").is_none());

        def.add_flow_object(FlowObject::task("x", "Extra", TaskType::ServiceTask));
        assert!(def.get_flow_object_by_name("Extra").is_some());

        def.add_sequence_flow(SequenceFlow::new("f4", "", "t", "x"));
        let task = def.get_flow_object("t").unwrap();
        assert_eq!(def.get_outgoing_sequence_flows(task).len(), 2);
    }

    #[test]
    fn test_wait_classification() {
        assert!(FlowObject::task("a", "A", TaskType::Task).is_wait_task());
        assert!(FlowObject::task("a", "A", TaskType::ReceiveTask).is_wait_task());
        assert!(!FlowObject::task("a", "A", TaskType::ServiceTask).is_wait_task());

        let called = Arc::new(ProcessDefinition::new("c", "Called"));
        let call = FlowObject::call_activity("c1", "Call", called);
        assert!(call.is_wait_activity());
        assert!(call.called_definition().is_some());
        assert_eq!(call.type_name(), "callActivity");
    }

    #[test]
    fn test_start_events() {
        let def = create_test_definition();
        let starts = def.get_start_events();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].name, "Start");
    }

    #[test]
    fn test_participant_lookup_ambiguous() {
        let mut def = ProcessDefinition::new("p", "P");
        def.set_collaboration(
            vec![
                Participant {
                    name: "Buyer".to_string(),
                    process_ref: "a".to_string(),
                },
                Participant {
                    name: "Buyer".to_string(),
                    process_ref: "b".to_string(),
                },
            ],
            Vec::new(),
        );

        assert!(def.get_participant_by_name("Seller").unwrap().is_none());
        assert!(matches!(
            def.get_participant_by_name("Buyer"),
            Err(DefinitionError::AmbiguousParticipant { count: 2, .. })
        ));
    }

    #[test]
    fn test_message_flow_lookup_by_source_name() {
        let mut def = create_test_definition();
        def.set_collaboration(
            Vec::new(),
            vec![MessageFlow::new("m1", "order", "t", "other_task")],
        );

        assert_eq!(def.get_message_flow("order").unwrap().bpmn_id, "m1");
        assert_eq!(def.get_message_flow("Review").unwrap().bpmn_id, "m1");
        assert!(def.get_message_flow("End").is_none());
    }

    #[test]
    fn test_kind_serializes_with_type_tag() {
        let fo = FlowObject::task("t", "Review", TaskType::UserTask);
        let json = serde_json::to_value(&fo).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["taskType"], "userTask");
        assert_eq!(json["id"], "t");
    }
}
