//! Token-Emission Rules
//!
//! Each flow-object variant decides two things: what happens when a token
//! arrives ([`arrival_rule`]) and where tokens go once its handler has
//! completed ([`plan_emission`]). The engine applies the decision; these
//! functions only read the definition.

use crate::definition::{FlowObject, FlowObjectKind, ProcessDefinition, SequenceFlow};

/// Behavior on token arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArrivalRule {
    /// Run the handler, then emit.
    Run,
    /// Park the token until `task_done`.
    WaitTask,
    /// Park the token until the event is triggered or its timer fires.
    CatchEvent,
    /// Spawn the nested process and wait for it to finish.
    Descend,
}

/// Where tokens go after a handler completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Emission {
    /// One token to each named flow object, in declaration order.
    Along(Vec<String>),
    /// No outgoing flow could be taken; the token stays.
    Stall,
    /// End event: the process may be finished.
    Finish,
}

pub(crate) fn arrival_rule(flow_object: &FlowObject) -> ArrivalRule {
    match &flow_object.kind {
        FlowObjectKind::Task { task_type } if task_type.is_wait_task() => ArrivalRule::WaitTask,
        FlowObjectKind::IntermediateCatchEvent { .. } => ArrivalRule::CatchEvent,
        FlowObjectKind::CallActivity { .. } | FlowObjectKind::SubProcess { .. } => {
            ArrivalRule::Descend
        }
        _ => ArrivalRule::Run,
    }
}

pub(crate) fn is_join(flow_object: &FlowObject) -> bool {
    matches!(flow_object.kind, FlowObjectKind::ParallelGateway)
}

/// True once `tokens_at_gateway` tokens cover every distinct incoming flow.
pub(crate) fn join_ready(
    definition: &ProcessDefinition,
    gateway: &FlowObject,
    tokens_at_gateway: usize,
) -> bool {
    tokens_at_gateway >= definition.distinct_incoming_count(gateway).max(1)
}

/// Decides the emission of `flow_object`.
///
/// `guard` is consulted for the outgoing flows of a diverging exclusive
/// gateway in declaration order, and not after the first flow it accepts.
pub(crate) fn plan_emission(
    definition: &ProcessDefinition,
    flow_object: &FlowObject,
    guard: &mut dyn FnMut(&SequenceFlow) -> bool,
) -> Emission {
    let outgoing = definition.get_outgoing_sequence_flows(flow_object);

    match &flow_object.kind {
        FlowObjectKind::EndEvent => Emission::Finish,
        FlowObjectKind::ExclusiveGateway if outgoing.len() > 1 => outgoing
            .into_iter()
            .find(|flow| guard(flow))
            .map(|flow| Emission::Along(target_names(definition, &[flow])))
            .unwrap_or(Emission::Stall),
        _ => Emission::Along(target_names(definition, &outgoing)),
    }
}

fn target_names(definition: &ProcessDefinition, flows: &[&SequenceFlow]) -> Vec<String> {
    flows
        .iter()
        .filter_map(|flow| definition.get_flow_object(&flow.target_ref))
        .map(|fo| fo.name.clone())
        .collect()
}

/// Name used for guard lookup: the flow name, or its id if unnamed.
pub(crate) fn flow_label(flow: &SequenceFlow) -> &str {
    if flow.name.is_empty() {
        &flow.bpmn_id
    } else {
        &flow.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EventDefinition, SequenceFlow, TaskType};
    use std::sync::Arc;

    fn gateway_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("p", "P");
        def.add_flow_object(FlowObject::exclusive_gateway("g", "Decide"));
        def.add_flow_object(FlowObject::task("b", "TaskB", TaskType::UserTask));
        def.add_flow_object(FlowObject::task("c", "TaskC", TaskType::UserTask));
        def.add_flow_object(FlowObject::parallel_gateway("j", "Join"));
        def.add_sequence_flow(SequenceFlow::new("f1", "ok", "g", "b"));
        def.add_sequence_flow(SequenceFlow::new("f2", "nok", "g", "c"));
        def.add_sequence_flow(SequenceFlow::new("f3", "", "b", "j"));
        def.add_sequence_flow(SequenceFlow::new("f4", "", "c", "j"));
        def
    }

    #[test]
    fn test_arrival_rules() {
        let called = Arc::new(ProcessDefinition::new("c", "C"));
        assert_eq!(
            arrival_rule(&FlowObject::task("t", "T", TaskType::UserTask)),
            ArrivalRule::WaitTask
        );
        assert_eq!(
            arrival_rule(&FlowObject::task("t", "T", TaskType::ServiceTask)),
            ArrivalRule::Run
        );
        assert_eq!(
            arrival_rule(&FlowObject::intermediate_catch_event(
                "i",
                "I",
                EventDefinition::Timer
            )),
            ArrivalRule::CatchEvent
        );
        assert_eq!(
            arrival_rule(&FlowObject::parallel_gateway("j", "J")),
            ArrivalRule::Run
        );
        assert!(is_join(&FlowObject::parallel_gateway("j", "J")));
        assert!(!is_join(&FlowObject::exclusive_gateway("g", "G")));
        assert_eq!(
            arrival_rule(&FlowObject::sub_process("s", "S", called)),
            ArrivalRule::Descend
        );
    }

    #[test]
    fn test_exclusive_gateway_takes_first_truthy_guard() {
        let def = gateway_definition();
        let gateway = def.get_flow_object_by_name("Decide").unwrap();

        let mut asked = Vec::new();
        let emission = plan_emission(&def, gateway, &mut |flow| {
            asked.push(flow_label(flow).to_string());
            true
        });

        assert_eq!(emission, Emission::Along(vec!["TaskB".to_string()]));
        assert_eq!(asked, vec!["ok"]);
    }

    #[test]
    fn test_exclusive_gateway_stalls_when_all_guards_falsy() {
        let def = gateway_definition();
        let gateway = def.get_flow_object_by_name("Decide").unwrap();

        let mut asked = 0;
        let emission = plan_emission(&def, gateway, &mut |_flow| {
            asked += 1;
            false
        });

        assert_eq!(emission, Emission::Stall);
        assert_eq!(asked, 2);
    }

    #[test]
    fn test_join_threshold() {
        let def = gateway_definition();
        let join = def.get_flow_object_by_name("Join").unwrap();
        assert!(!join_ready(&def, join, 1));
        assert!(join_ready(&def, join, 2));
    }

    #[test]
    fn test_default_emission_follows_all_flows() {
        let def = gateway_definition();
        let task = def.get_flow_object_by_name("TaskB").unwrap();
        let emission = plan_emission(&def, task, &mut |_flow| false);
        assert_eq!(emission, Emission::Along(vec!["Join".to_string()]));

        let end = FlowObject::end_event("e", "End");
        assert_eq!(plan_emission(&def, &end, &mut |_flow| false), Emission::Finish);
    }
}
