//! Process Definition Loader
//!
//! Loads process definitions from YAML (or JSON) documents. Call activities
//! reference other definition files through `calledElement`; those are
//! resolved relative to the directory of the referencing file and loaded
//! recursively. Loaded definitions are validated before they are returned.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::collaboration::Collaboration;
use super::model::{FlowObjectKind, MessageFlow, Participant, ProcessDefinition};
use super::validator::{validate_definition, ErrorQueue};
use crate::error::DefinitionError;

/// A document describing several collaborating processes.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CollaborationDocument {
    processes: Vec<ProcessDefinition>,
    #[serde(default)]
    participants: Vec<Participant>,
    #[serde(default)]
    message_flows: Vec<MessageFlow>,
}

fn read_file(path: &Path) -> Result<String, DefinitionError> {
    fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_document<T>(content: &str, path: &Path) -> Result<T, DefinitionError>
where
    T: for<'de> Deserialize<'de>,
{
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Loads and validates a process definition file.
///
/// # Example
///
/// ```rust,no_run
/// use bpmnrunner::definition::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("order.yaml")?;
///     println!("Loaded {} flow objects", definition.flow_objects().len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<Arc<ProcessDefinition>, DefinitionError> {
    let path = path.as_ref();
    let mut stack = Vec::new();
    let definition = load_unvalidated(path, &mut stack)?;

    let mut queue = ErrorQueue::new();
    validate_definition(&definition, &mut queue);
    queue.into_result()?;

    info!(
        "Loaded process definition '{}' ({} flow objects, {} sequence flows)",
        definition.name,
        definition.flow_objects().len(),
        definition.sequence_flows().len()
    );
    Ok(Arc::new(definition))
}

/// Parses a YAML definition from memory. Call activity references are
/// resolved relative to `base_dir`.
pub fn load_definition_str(
    content: &str,
    base_dir: impl AsRef<Path>,
) -> Result<Arc<ProcessDefinition>, DefinitionError> {
    let mut definition: ProcessDefinition = serde_yaml::from_str(content)?;
    let mut stack = Vec::new();
    resolve_called_elements(&mut definition, base_dir.as_ref(), &mut stack)?;

    let mut queue = ErrorQueue::new();
    validate_definition(&definition, &mut queue);
    queue.into_result()?;
    Ok(Arc::new(definition))
}

/// Loads a collaboration document and attaches it to every process in it.
pub fn load_collaboration(
    path: impl AsRef<Path>,
) -> Result<Vec<Arc<ProcessDefinition>>, DefinitionError> {
    let path = path.as_ref();
    let content = read_file(path)?;
    let document: CollaborationDocument = parse_document(&content, path)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut queue = ErrorQueue::new();
    let mut processes = Vec::with_capacity(document.processes.len());

    for mut definition in document.processes {
        let mut stack = vec![path.to_path_buf()];
        resolve_called_elements(&mut definition, base_dir, &mut stack)?;
        validate_definition(&definition, &mut queue);
        processes.push(definition);
    }
    queue.into_result()?;

    let collaboration = Collaboration::new(document.participants, document.message_flows);
    Ok(collaboration.attach(processes))
}

/// Writes a definition as YAML.
pub fn save_definition(
    definition: &ProcessDefinition,
    path: impl AsRef<Path>,
) -> Result<(), DefinitionError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(definition)?;
    fs::write(path, yaml).map_err(|source| DefinitionError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!("Process definition saved to: {}", path.display());
    Ok(())
}

fn load_unvalidated(
    path: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<ProcessDefinition, DefinitionError> {
    info!("Loading process definition from: {}", path.display());

    let content = read_file(path)?;
    debug!("Definition content loaded ({} bytes)", content.len());

    let mut definition: ProcessDefinition = parse_document(&content, path)?;

    stack.push(path.to_path_buf());
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_called_elements(&mut definition, base_dir, stack)?;
    stack.pop();

    Ok(definition)
}

/// Loads the definitions referenced by call activities, descending into
/// embedded sub-processes.
fn resolve_called_elements(
    definition: &mut ProcessDefinition,
    base_dir: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<(), DefinitionError> {
    for flow_object in definition.flow_objects_mut() {
        match &mut flow_object.kind {
            FlowObjectKind::CallActivity {
                called_element: Some(location),
                definition: called @ None,
            } => {
                let called_path = base_dir.join(location.as_str());

                // A file calling itself (directly or indirectly) stays
                // unresolved and is reported by validation.
                if stack.contains(&called_path) {
                    debug!(
                        "Call activity '{}' references '{}' recursively",
                        flow_object.name,
                        called_path.display()
                    );
                    continue;
                }

                debug!(
                    "Resolving call activity '{}' -> {}",
                    flow_object.name,
                    called_path.display()
                );
                *called = Some(Arc::new(load_unvalidated(&called_path, stack)?));
            }
            FlowObjectKind::SubProcess { definition: embedded } => {
                resolve_called_elements(Arc::make_mut(embedded), base_dir, stack)?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SIMPLE_PROCESS: &str = r#"
id: simple
name: Simple
flowObjects:
  - id: s
    name: Start
    type: startEvent
  - id: t
    name: Review
    type: task
    taskType: userTask
  - id: e
    name: End
    type: endEvent
sequenceFlows:
  - id: f1
    sourceRef: s
    targetRef: t
  - id: f2
    sourceRef: t
    targetRef: e
"#;

    #[test]
    fn test_load_definition_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("simple.yaml");
        fs::write(&path, SIMPLE_PROCESS).unwrap();

        let definition = load_definition(&path).unwrap();
        assert_eq!(definition.name, "Simple");
        assert_eq!(definition.flow_objects().len(), 3);
        assert!(definition.get_flow_object_by_name("Review").unwrap().is_wait_task());
    }

    #[test]
    fn test_load_definition_file_not_found() {
        let result = load_definition("/nonexistent/path/process.yaml");
        assert!(matches!(result, Err(DefinitionError::Io { .. })));
    }

    #[test]
    fn test_load_definition_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(matches!(
            load_definition(&path),
            Err(DefinitionError::Yaml(_))
        ));
    }

    #[test]
    fn test_call_activity_resolved_relative_to_file() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("called.yaml"), SIMPLE_PROCESS).unwrap();

        let main = r#"
id: main
name: Main
flowObjects:
  - id: s
    name: Begin
    type: startEvent
  - id: c
    name: Call Simple
    type: callActivity
    calledElement: called.yaml
  - id: e
    name: Finish
    type: endEvent
sequenceFlows:
  - id: f1
    sourceRef: s
    targetRef: c
  - id: f2
    sourceRef: c
    targetRef: e
"#;
        let path = temp_dir.path().join("main.yaml");
        fs::write(&path, main).unwrap();

        let definition = load_definition(&path).unwrap();
        let call = definition.get_flow_object_by_name("Call Simple").unwrap();
        assert_eq!(call.called_definition().unwrap().name, "Simple");
    }

    #[test]
    fn test_missing_call_reference_fails_validation() {
        let content = r#"
id: main
name: Main
flowObjects:
  - id: s
    name: Begin
    type: startEvent
  - id: c
    name: Call Nothing
    type: callActivity
  - id: e
    name: Finish
    type: endEvent
sequenceFlows:
  - id: f1
    sourceRef: s
    targetRef: c
  - id: f2
    sourceRef: c
    targetRef: e
"#;
        let result = load_definition_str(content, ".");
        assert!(matches!(result, Err(DefinitionError::Invalid(_))));
    }

    #[test]
    fn test_save_and_reload_definition() {
        let temp_dir = tempdir().unwrap();
        let definition = load_definition_str(SIMPLE_PROCESS, ".").unwrap();

        let path = temp_dir.path().join("saved.yaml");
        save_definition(&definition, &path).unwrap();
        assert!(path.exists());

        let reloaded = load_definition(&path).unwrap();
        assert_eq!(reloaded.flow_objects().len(), definition.flow_objects().len());
    }

    #[test]
    fn test_load_collaboration() {
        let temp_dir = tempdir().unwrap();
        let document = r#"
processes:
  - id: buyer
    name: Buyer
    flowObjects:
      - id: bs
        name: Buy
        type: startEvent
      - id: bt
        name: Send Order
        type: task
        taskType: sendTask
      - id: be
        name: Bought
        type: endEvent
    sequenceFlows:
      - { id: bf1, sourceRef: bs, targetRef: bt }
      - { id: bf2, sourceRef: bt, targetRef: be }
  - id: seller
    name: Seller
    flowObjects:
      - id: ss
        name: Order Received
        type: startEvent
      - id: se
        name: Sold
        type: endEvent
    sequenceFlows:
      - { id: sf1, sourceRef: ss, targetRef: se }
participants:
  - { name: Buyer, processRef: buyer }
  - { name: Seller, processRef: seller }
messageFlows:
  - { id: m1, name: order, sourceRef: bt, targetRef: ss }
"#;
        let path = temp_dir.path().join("collaboration.yaml");
        fs::write(&path, document).unwrap();

        let processes = load_collaboration(&path).unwrap();
        assert_eq!(processes.len(), 2);
        let flow = processes[0].get_message_flow("Send Order").unwrap();
        assert_eq!(flow.target_process_definition_id.as_deref(), Some("seller"));
    }
}
