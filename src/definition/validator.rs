//! Process Definition Validation
//!
//! Structural checks over a process graph. Every flow object and sequence
//! flow is visited and *all* problems are collected into an [`ErrorQueue`]
//! instead of failing on the first one:
//! - Flow object names are unique and non-empty
//! - Sequence flows reference existing flow objects
//! - Per-variant rules (events, gateways, boundary attachments, call activities)
//!
//! Called and embedded definitions are validated recursively.

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;

use super::model::{FlowObject, FlowObjectKind, ProcessDefinition};
use crate::error::DefinitionError;

/// A single structural problem, identified by a stable code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Flow object name '{name}' is not unique")]
    DuplicateName { name: String },

    #[error("Flow object '{id}' has no name")]
    EmptyName { id: String },

    #[error("Flow object id '{id}' is not unique")]
    DuplicateId { id: String },

    #[error("Sequence flow '{flow}' has unknown source '{reference}'")]
    UnknownSourceRef { flow: String, reference: String },

    #[error("Sequence flow '{flow}' has unknown target '{reference}'")]
    UnknownTargetRef { flow: String, reference: String },

    #[error("Start event '{name}' must not have incoming sequence flows")]
    StartEventIncoming { name: String },

    #[error("Start event '{name}' must have exactly one outgoing sequence flow")]
    StartEventOutgoing { name: String },

    #[error("End event '{name}' must not have outgoing sequence flows")]
    EndEventOutgoing { name: String },

    #[error("End event '{name}' must have at least one incoming sequence flow")]
    EndEventIncoming { name: String },

    #[error("Boundary event '{name}' must not have incoming sequence flows")]
    BoundaryEventIncoming { name: String },

    #[error("Boundary event '{name}' must have exactly one outgoing sequence flow")]
    BoundaryEventOutgoing { name: String },

    #[error("Boundary event '{name}' is attached to unknown activity '{attached_to}'")]
    BoundaryAttachmentUnknown { name: String, attached_to: String },

    #[error("Boundary event '{name}' is attached to '{attached_to}' which is not a wait task or call activity")]
    BoundaryAttachmentNotWaitActivity { name: String, attached_to: String },

    #[error("Intermediate event '{name}' must have exactly one outgoing sequence flow")]
    IntermediateEventOutgoing { name: String },

    #[error("Gateway '{name}' needs more than one incoming or outgoing sequence flow")]
    GatewayNotBranching { name: String },

    #[error("Gateway '{name}' needs at least one incoming and one outgoing sequence flow")]
    GatewayUnconnected { name: String },

    #[error("Call activity '{name}' must reference a file")]
    CallActivityMissingReference { name: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "FO1",
            Self::EmptyName { .. } => "FO2",
            Self::DuplicateId { .. } => "FO3",
            Self::UnknownSourceRef { .. } => "SF1",
            Self::UnknownTargetRef { .. } => "SF2",
            Self::StartEventIncoming { .. } => "SE1",
            Self::StartEventOutgoing { .. } => "SE2",
            Self::EndEventOutgoing { .. } => "EE1",
            Self::EndEventIncoming { .. } => "EE2",
            Self::BoundaryEventIncoming { .. } => "BE1",
            Self::BoundaryEventOutgoing { .. } => "BE2",
            Self::BoundaryAttachmentUnknown { .. } => "BE3",
            Self::BoundaryAttachmentNotWaitActivity { .. } => "BE4",
            Self::IntermediateEventOutgoing { .. } => "IE1",
            Self::GatewayNotBranching { .. } => "GW1",
            Self::GatewayUnconnected { .. } => "GW2",
            Self::CallActivityMissingReference { .. } => "CA1",
        }
    }
}

/// Accumulates validation errors.
#[derive(Debug, Default)]
pub struct ErrorQueue {
    errors: Vec<ValidationError>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        debug!("Validation error [{}]: {}", error.code(), error);
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Converts the collected errors into a single result.
    pub fn into_result(self) -> Result<(), DefinitionError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::Invalid(self.errors))
        }
    }
}

/// Validates a definition, adding every problem to `queue`.
pub fn validate_definition(definition: &ProcessDefinition, queue: &mut ErrorQueue) {
    info!(
        "Validating process definition '{}' with {} flow objects",
        definition.name,
        definition.flow_objects().len()
    );

    let mut seen_names: HashSet<&str> = HashSet::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for flow_object in definition.flow_objects() {
        if flow_object.name.trim().is_empty() {
            queue.add_error(ValidationError::EmptyName {
                id: flow_object.bpmn_id.clone(),
            });
        } else if !seen_names.insert(flow_object.name.as_str()) {
            queue.add_error(ValidationError::DuplicateName {
                name: flow_object.name.clone(),
            });
        }

        if !seen_ids.insert(flow_object.bpmn_id.as_str()) {
            queue.add_error(ValidationError::DuplicateId {
                id: flow_object.bpmn_id.clone(),
            });
        }

        validate_flow_object(definition, flow_object, queue);
    }

    for flow in definition.sequence_flows() {
        if definition.get_flow_object(&flow.source_ref).is_none() {
            queue.add_error(ValidationError::UnknownSourceRef {
                flow: flow.bpmn_id.clone(),
                reference: flow.source_ref.clone(),
            });
        }
        if definition.get_flow_object(&flow.target_ref).is_none() {
            queue.add_error(ValidationError::UnknownTargetRef {
                flow: flow.bpmn_id.clone(),
                reference: flow.target_ref.clone(),
            });
        }
    }
}

/// Validates a definition and returns all problems at once.
pub fn validate(definition: &ProcessDefinition) -> Result<(), DefinitionError> {
    let mut queue = ErrorQueue::new();
    validate_definition(definition, &mut queue);
    queue.into_result()
}

/// Applies the rules specific to one flow-object variant.
fn validate_flow_object(
    definition: &ProcessDefinition,
    flow_object: &FlowObject,
    queue: &mut ErrorQueue,
) {
    let incoming = definition.get_incoming_sequence_flows(flow_object).len();
    let outgoing = definition.get_outgoing_sequence_flows(flow_object).len();
    let name = flow_object.name.clone();

    match &flow_object.kind {
        FlowObjectKind::StartEvent { .. } => {
            if incoming > 0 {
                queue.add_error(ValidationError::StartEventIncoming { name: name.clone() });
            }
            if outgoing != 1 {
                queue.add_error(ValidationError::StartEventOutgoing { name });
            }
        }
        FlowObjectKind::EndEvent => {
            if outgoing > 0 {
                queue.add_error(ValidationError::EndEventOutgoing { name: name.clone() });
            }
            if incoming == 0 {
                queue.add_error(ValidationError::EndEventIncoming { name });
            }
        }
        FlowObjectKind::BoundaryEvent {
            attached_to_ref, ..
        } => {
            if incoming > 0 {
                queue.add_error(ValidationError::BoundaryEventIncoming { name: name.clone() });
            }
            if outgoing != 1 {
                queue.add_error(ValidationError::BoundaryEventOutgoing { name: name.clone() });
            }
            match definition.get_flow_object(attached_to_ref) {
                None => queue.add_error(ValidationError::BoundaryAttachmentUnknown {
                    name,
                    attached_to: attached_to_ref.clone(),
                }),
                Some(activity) if !activity.is_wait_activity() => {
                    queue.add_error(ValidationError::BoundaryAttachmentNotWaitActivity {
                        name,
                        attached_to: activity.name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        FlowObjectKind::IntermediateCatchEvent { .. }
        | FlowObjectKind::IntermediateThrowEvent { .. } => {
            if outgoing != 1 {
                queue.add_error(ValidationError::IntermediateEventOutgoing { name });
            }
        }
        FlowObjectKind::ExclusiveGateway | FlowObjectKind::ParallelGateway => {
            if incoming == 0 || outgoing == 0 {
                queue.add_error(ValidationError::GatewayUnconnected { name: name.clone() });
            }
            if incoming <= 1 && outgoing <= 1 {
                queue.add_error(ValidationError::GatewayNotBranching { name });
            }
        }
        FlowObjectKind::CallActivity { definition, .. } => match definition {
            Some(called) => validate_definition(called, queue),
            None => queue.add_error(ValidationError::CallActivityMissingReference { name }),
        },
        FlowObjectKind::SubProcess { definition } => validate_definition(definition, queue),
        FlowObjectKind::Task { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::model::{EventDefinition, SequenceFlow, TaskType};

    fn create_valid_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("p", "Valid");
        def.add_flow_object(FlowObject::start_event("s", "Start"));
        def.add_flow_object(FlowObject::task("t", "Work", TaskType::UserTask));
        def.add_flow_object(FlowObject::end_event("e", "End"));
        def.add_sequence_flow(SequenceFlow::new("f1", "", "s", "t"));
        def.add_sequence_flow(SequenceFlow::new("f2", "", "t", "e"));
        def
    }

    fn codes(def: &ProcessDefinition) -> Vec<&'static str> {
        let mut queue = ErrorQueue::new();
        validate_definition(def, &mut queue);
        queue.errors().iter().map(|e| e.code()).collect()
    }

    #[test]
    fn test_valid_definition() {
        let def = create_valid_definition();
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn test_duplicate_names_detected() {
        let mut def = create_valid_definition();
        def.add_flow_object(FlowObject::task("t2", "Work", TaskType::ServiceTask));
        assert!(codes(&def).contains(&"FO1"));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut def = ProcessDefinition::new("p", "Broken");
        def.add_flow_object(FlowObject::start_event("s", "Start"));
        def.add_flow_object(FlowObject::end_event("e", "End"));
        def.add_sequence_flow(SequenceFlow::new("f1", "", "s", "ghost"));

        let found = codes(&def);
        assert!(found.contains(&"SF2"));
        assert!(found.contains(&"EE2"));
        assert!(found.len() >= 2);
    }

    #[test]
    fn test_gateway_needs_branching() {
        let mut def = ProcessDefinition::new("p", "Gateway");
        def.add_flow_object(FlowObject::start_event("s", "Start"));
        def.add_flow_object(FlowObject::exclusive_gateway("g", "Decide"));
        def.add_flow_object(FlowObject::end_event("e", "End"));
        def.add_sequence_flow(SequenceFlow::new("f1", "", "s", "g"));
        def.add_sequence_flow(SequenceFlow::new("f2", "", "g", "e"));

        assert!(codes(&def).contains(&"GW1"));
    }

    #[test]
    fn test_boundary_must_attach_to_wait_activity() {
        let mut def = ProcessDefinition::new("p", "Boundary");
        def.add_flow_object(FlowObject::start_event("s", "Start"));
        def.add_flow_object(FlowObject::task("t", "Auto", TaskType::ServiceTask));
        def.add_flow_object(FlowObject::boundary_event(
            "b",
            "Timeout",
            "t",
            EventDefinition::Timer,
        ));
        def.add_flow_object(FlowObject::end_event("e", "End"));
        def.add_sequence_flow(SequenceFlow::new("f1", "", "s", "t"));
        def.add_sequence_flow(SequenceFlow::new("f2", "", "t", "e"));
        def.add_sequence_flow(SequenceFlow::new("f3", "", "b", "e"));

        assert_eq!(codes(&def), vec!["BE4"]);
    }

    #[test]
    fn test_boundary_unknown_attachment() {
        let mut def = create_valid_definition();
        def.add_flow_object(FlowObject::boundary_event(
            "b",
            "Timeout",
            "nope",
            EventDefinition::Timer,
        ));
        def.add_sequence_flow(SequenceFlow::new("f3", "", "b", "e"));

        assert_eq!(codes(&def), vec!["BE3"]);
    }

    #[test]
    fn test_call_activity_must_reference_definition() {
        let mut def = create_valid_definition();
        def.add_flow_object(FlowObject::new(
            "c",
            "Call",
            FlowObjectKind::CallActivity {
                called_element: Some("missing.yaml".to_string()),
                definition: None,
            },
        ));

        let err = validate(&def).unwrap_err();
        assert!(err.to_string().contains("must reference a file"));
    }

    #[test]
    fn test_error_codes_are_unique() {
        let errors = vec![
            ValidationError::DuplicateName { name: String::new() },
            ValidationError::StartEventOutgoing { name: String::new() },
            ValidationError::BoundaryEventOutgoing { name: String::new() },
            ValidationError::GatewayNotBranching { name: String::new() },
            ValidationError::CallActivityMissingReference { name: String::new() },
        ];
        let codes: HashSet<&str> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }
}
