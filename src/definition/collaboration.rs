//! Collaborations
//!
//! A collaboration groups several process definitions (participants) and
//! the message flows between them. Attaching a collaboration resolves, for
//! every message flow, which process definition owns its source and its
//! target flow object.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::{MessageFlow, Participant, ProcessDefinition};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Collaboration {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub message_flows: Vec<MessageFlow>,
}

impl Collaboration {
    pub fn new(participants: Vec<Participant>, message_flows: Vec<MessageFlow>) -> Self {
        Self {
            participants,
            message_flows,
        }
    }

    /// Installs the collaboration on each definition.
    ///
    /// Every definition receives the full participant list and the message
    /// flows it is the source or target of, with the source/target process
    /// definition ids resolved.
    pub fn attach(&self, definitions: Vec<ProcessDefinition>) -> Vec<Arc<ProcessDefinition>> {
        let owner_of = |flow_object_id: &str| -> Option<String> {
            definitions
                .iter()
                .find(|def| def.get_flow_object(flow_object_id).is_some())
                .map(|def| def.bpmn_id.clone())
        };

        let resolved: Vec<MessageFlow> = self
            .message_flows
            .iter()
            .map(|flow| {
                let mut flow = flow.clone();
                flow.source_process_definition_id = owner_of(&flow.source_ref);
                flow.target_process_definition_id = owner_of(&flow.target_ref);

                if flow.target_process_definition_id.is_none() {
                    warn!(
                        "Message flow '{}' targets unknown flow object '{}'",
                        flow.bpmn_id, flow.target_ref
                    );
                }
                flow
            })
            .collect();

        definitions
            .into_iter()
            .map(|mut def| {
                let own_flows: Vec<MessageFlow> = resolved
                    .iter()
                    .filter(|flow| {
                        flow.source_process_definition_id.as_deref() == Some(def.bpmn_id.as_str())
                            || flow.target_process_definition_id.as_deref()
                                == Some(def.bpmn_id.as_str())
                    })
                    .cloned()
                    .collect();

                debug!(
                    "Attaching collaboration to '{}': {} participants, {} message flows",
                    def.name,
                    self.participants.len(),
                    own_flows.len()
                );

                def.set_collaboration(self.participants.clone(), own_flows);
                Arc::new(def)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::model::{FlowObject, TaskType};

    fn participant(name: &str, process_ref: &str) -> Participant {
        Participant {
            name: name.to_string(),
            process_ref: process_ref.to_string(),
        }
    }

    #[test]
    fn test_attach_resolves_process_definition_ids() {
        let mut buyer = ProcessDefinition::new("buyer", "Buyer");
        buyer.add_flow_object(FlowObject::task("send", "Send Order", TaskType::SendTask));

        let mut seller = ProcessDefinition::new("seller", "Seller");
        seller.add_flow_object(FlowObject::start_event("recv", "Order Received"));

        let collaboration = Collaboration::new(
            vec![participant("Buyer", "buyer"), participant("Seller", "seller")],
            vec![MessageFlow::new("m1", "order", "send", "recv")],
        );

        let attached = collaboration.attach(vec![buyer, seller]);
        assert_eq!(attached.len(), 2);

        let flow = attached[0].get_message_flow("order").unwrap();
        assert_eq!(flow.source_process_definition_id.as_deref(), Some("buyer"));
        assert_eq!(flow.target_process_definition_id.as_deref(), Some("seller"));

        assert_eq!(attached[1].message_flows().len(), 1);
        assert_eq!(attached[1].participants().len(), 2);
    }

    #[test]
    fn test_attach_skips_unrelated_flows() {
        let a = ProcessDefinition::new("a", "A");
        let collaboration = Collaboration::new(
            Vec::new(),
            vec![MessageFlow::new("m1", "x", "nowhere", "elsewhere")],
        );

        let attached = collaboration.attach(vec![a]);
        assert!(attached[0].message_flows().is_empty());
    }
}
