/// Process definition parsing
///
/// Turns uploaded resource bytes into `ProcessModel`s. Two formats are accepted:
/// - BPMN 2.0 XML (the subset produced by Flowable/Activiti/bpmn.io modelers)
/// - JSON, the serde form of `ProcessModel` (single object or array)
///
/// Structural validation (dangling flows, start/end events, ...) is done by
/// `ProcessGraph::build`; this module only checks what it can see while reading.

use crate::error::{EngineError, EngineResult};
use crate::process::types::{Node, NodeKind, ProcessModel, SequenceFlow, DEFAULT_TASK_PRIORITY};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;

/// Elements allowed directly inside `<process>` that carry no execution semantics
const IGNORED_PROCESS_CHILDREN: &[&str] = &[
    "extensionElements",
    "laneSet",
    "textAnnotation",
    "association",
    "dataObject",
    "dataObjectReference",
    "property",
];

/// Parse a deployment resource, detecting the format from its first byte
pub fn parse_resource(bytes: &[u8]) -> EngineResult<Vec<ProcessModel>> {
    let first = bytes
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace() && *b != 0xEF && *b != 0xBB && *b != 0xBF);

    let models = match first {
        Some(b'<') => parse_bpmn_xml(bytes)?,
        Some(b'{') | Some(b'[') => parse_json(bytes)?,
        Some(_) => {
            return Err(EngineError::Parse(
                "resource is neither BPMN XML nor JSON".to_string(),
            ))
        }
        None => return Err(EngineError::Parse("resource is empty".to_string())),
    };

    if models.is_empty() {
        return Err(EngineError::Parse("resource does not define any process".to_string()));
    }
    Ok(models)
}

/// Parse the JSON deployment format
pub fn parse_json(bytes: &[u8]) -> EngineResult<Vec<ProcessModel>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::Parse(format!("invalid JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<ProcessModel>(item)
                .map_err(|e| EngineError::Parse(format!("invalid process model: {}", e)))
        })
        .collect()
}

/// Text currently being collected from a nested element
#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    None,
    Condition,
    Documentation,
}

/// Process under construction while the reader is inside `<process>`
#[derive(Debug)]
struct ProcessBuilder {
    key: String,
    name: Option<String>,
    description: Option<String>,
    nodes: Vec<Node>,
    flows: Vec<SequenceFlow>,
}

impl ProcessBuilder {
    fn finish(self) -> ProcessModel {
        ProcessModel {
            key: self.key,
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            flows: self.flows,
        }
    }
}

/// Streaming BPMN reader state
#[derive(Debug)]
struct BpmnReader {
    /// Local names of currently open elements
    stack: Vec<String>,
    current: Option<ProcessBuilder>,
    capture: Capture,
    text: String,
    processes: Vec<ProcessModel>,
}

/// Parse BPMN 2.0 XML
///
/// Namespace prefixes are ignored, so `flowable:assignee`, `activiti:assignee`
/// and `camunda:assignee` are all read as `assignee`.
pub fn parse_bpmn_xml(bytes: &[u8]) -> EngineResult<Vec<ProcessModel>> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut state = BpmnReader {
        stack: Vec::new(),
        current: None,
        capture: Capture::None,
        text: String::new(),
        processes: Vec::new(),
    };
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            EngineError::Parse(format!(
                "malformed XML at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(element) => {
                let name = local_name(&element)?;
                state.open(&name, &element)?;
                state.stack.push(name);
            }
            Event::Empty(element) => {
                let name = local_name(&element)?;
                state.open(&name, &element)?;
                state.close(&name);
            }
            Event::End(_) => {
                let name = state.stack.pop().unwrap_or_default();
                state.close(&name);
            }
            Event::Text(text) => {
                if state.capture != Capture::None {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| EngineError::Parse(format!("invalid XML text: {}", e)))?;
                    state.text.push_str(&unescaped);
                }
            }
            Event::CData(data) => {
                if state.capture != Capture::None {
                    state.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if state.current.is_some() {
        return Err(EngineError::Parse("unterminated <process> element".to_string()));
    }
    Ok(state.processes)
}

impl BpmnReader {
    fn parent(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    fn in_process(&self) -> bool {
        self.current.is_some()
    }

    /// Handle an opening (or self-closing) element
    fn open(&mut self, name: &str, element: &BytesStart<'_>) -> EngineResult<()> {
        if name == "process" {
            if self.in_process() {
                return Err(EngineError::Parse("nested <process> elements are not supported".to_string()));
            }
            let key = attr(element, "id")?.unwrap_or_default();
            tracing::debug!("📄 Reading BPMN process '{}'", key);
            self.current = Some(ProcessBuilder {
                key,
                name: attr(element, "name")?,
                description: None,
                nodes: Vec::new(),
                flows: Vec::new(),
            });
            return Ok(());
        }

        if !self.in_process() {
            // definitions, collaboration, bpmndi:* ... carry nothing we execute
            return Ok(());
        }

        match self.parent() {
            Some("process") => self.open_flow_element(name, element),
            Some("sequenceFlow") if name == "conditionExpression" => {
                self.capture = Capture::Condition;
                self.text.clear();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Handle a direct child of `<process>`
    fn open_flow_element(&mut self, name: &str, element: &BytesStart<'_>) -> EngineResult<()> {
        let kind = match name {
            "startEvent" => NodeKind::StartEvent,
            "endEvent" => NodeKind::EndEvent,
            "userTask" => NodeKind::UserTask {
                assignee: attr(element, "assignee")?,
                priority: match attr(element, "priority")? {
                    Some(raw) => raw.trim().parse().map_err(|_| {
                        EngineError::Parse(format!("invalid task priority '{}'", raw))
                    })?,
                    None => DEFAULT_TASK_PRIORITY,
                },
                due_in_hours: match attr(element, "dueDate")? {
                    Some(raw) => parse_due_hours(&raw)?,
                    None => None,
                },
            },
            "serviceTask" => NodeKind::ServiceTask {
                delegate: service_delegate(element)?.unwrap_or_default(),
            },
            "exclusiveGateway" => NodeKind::ExclusiveGateway {
                default_flow: attr(element, "default")?,
            },
            "sequenceFlow" => {
                let flow = SequenceFlow {
                    id: attr(element, "id")?.unwrap_or_default(),
                    source: attr(element, "sourceRef")?.unwrap_or_default(),
                    target: attr(element, "targetRef")?.unwrap_or_default(),
                    condition: None,
                };
                if let Some(builder) = self.current.as_mut() {
                    builder.flows.push(flow);
                }
                return Ok(());
            }
            "documentation" => {
                self.capture = Capture::Documentation;
                self.text.clear();
                return Ok(());
            }
            other if IGNORED_PROCESS_CHILDREN.contains(&other) => return Ok(()),
            other => {
                return Err(EngineError::Parse(format!(
                    "unsupported BPMN element <{}>",
                    other
                )))
            }
        };

        let node = Node {
            id: attr(element, "id")?.unwrap_or_default(),
            name: attr(element, "name")?,
            kind,
        };
        if let Some(builder) = self.current.as_mut() {
            builder.nodes.push(node);
        }
        Ok(())
    }

    /// Handle a closing element (self-closing elements are closed right away)
    fn close(&mut self, name: &str) {
        match (name, self.capture) {
            ("conditionExpression", Capture::Condition) => {
                let condition = self.text.trim().to_string();
                if let Some(flow) = self.current.as_mut().and_then(|b| b.flows.last_mut()) {
                    if !condition.is_empty() {
                        flow.condition = Some(condition);
                    }
                }
                self.capture = Capture::None;
            }
            ("documentation", Capture::Documentation) => {
                let text = self.text.trim().to_string();
                if let Some(builder) = self.current.as_mut() {
                    if !text.is_empty() {
                        builder.description = Some(text);
                    }
                }
                self.capture = Capture::None;
            }
            ("process", _) => {
                if let Some(builder) = self.current.take() {
                    tracing::debug!(
                        "✅ Read process '{}' with {} nodes and {} flows",
                        builder.key,
                        builder.nodes.len(),
                        builder.flows.len()
                    );
                    self.processes.push(builder.finish());
                }
            }
            _ => {}
        }
    }
}

fn local_name(element: &BytesStart<'_>) -> EngineResult<String> {
    let local = element.local_name();
    std::str::from_utf8(local.as_ref())
        .map(str::to_string)
        .map_err(|e| EngineError::Parse(format!("invalid element name: {}", e)))
}

/// Read an attribute by local name (namespace prefix ignored)
fn attr(element: &BytesStart<'_>, name: &str) -> EngineResult<Option<String>> {
    for attribute in element.attributes() {
        let attribute =
            attribute.map_err(|e| EngineError::Parse(format!("invalid XML attribute: {}", e)))?;
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            let value = attribute
                .unescape_value()
                .map_err(|e| EngineError::Parse(format!("invalid XML attribute value: {}", e)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Resolve the delegate identifier of a service task
///
/// `delegateExpression="${approvalSuccessDelegate}"` -> "approvalSuccessDelegate"
/// `class="com.acme.ApprovalRejectDelegate"` -> "approvalRejectDelegate"
fn service_delegate(element: &BytesStart<'_>) -> EngineResult<Option<String>> {
    if let Some(expression) = attr(element, "delegateExpression")? {
        return Ok(Some(strip_expression(&expression).trim().to_string()));
    }
    if let Some(class) = attr(element, "class")? {
        let simple = class.rsplit('.').next().unwrap_or(&class);
        return Ok(Some(lower_camel(simple)));
    }
    attr(element, "delegate")
}

/// "${foo}" -> "foo"; anything else unchanged
pub fn strip_expression(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("${")
        .or_else(|| trimmed.strip_prefix("#{"))
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
}

fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Minimal ISO-8601 duration support for `dueDate`: "P3D", "PT4H", "P1DT12H"
///
/// Unsupported formats are ignored; durations that overflow are rejected.
fn parse_due_hours(raw: &str) -> EngineResult<Option<i64>> {
    let Some((days, hours)) = split_duration(raw.trim()) else {
        tracing::warn!("⚠️ Ignoring unsupported dueDate '{}'", raw);
        return Ok(None);
    };

    days.checked_mul(24)
        .and_then(|day_hours| day_hours.checked_add(hours))
        .map(Some)
        .ok_or_else(|| EngineError::Parse(format!("dueDate '{}' is out of range", raw)))
}

/// Split "P{d}DT{h}H" into (days, hours)
fn split_duration(raw: &str) -> Option<(i64, i64)> {
    let rest = raw.strip_prefix('P')?;
    let (days, time) = rest.split_once('T').unwrap_or((rest, ""));
    if days.is_empty() && time.is_empty() {
        return None;
    }

    let days = match days {
        "" => 0,
        days => days.strip_suffix('D')?.parse::<i64>().ok()?,
    };
    let hours = match time {
        "" => 0,
        time => time.strip_suffix('H')?.parse::<i64>().ok()?,
    };
    Some((days, hours))
}
