use crate::{FlowError, Value, ValueMap};
use serde::{Deserialize, Serialize};

pub type WorkflowId = String;
pub type NodeId = String;

/// Type tag of the unique entry node.
pub const START_NODE_TYPE: &str = "start";
/// Type tag of terminal nodes whose outputs form the run outputs.
pub const END_NODE_TYPE: &str = "end";

/// Complete workflow definition. Immutable once handed to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Connection>,
    #[serde(default)]
    pub settings: ValueMap,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0".to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Default-port edge from `source` to `target`.
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.connect_ports(source, "", target, "");
    }

    pub fn connect_ports(
        &mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) {
        let source = source.into();
        let target = target.into();
        self.edges.push(Connection {
            id: format!("e{}-{}-{}", self.edges.len(), source, target),
            source,
            source_handle: source_handle.into(),
            target,
            target_handle: target_handle.into(),
            label: String::new(),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Parses the ingress format, accepting the `data`-nested variant.
    pub fn from_json(raw: &str) -> Result<Self, FlowError> {
        let json: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_json_value(json)
    }

    pub fn from_json_value(mut json: serde_json::Value) -> Result<Self, FlowError> {
        if let Some(nodes) = json.get_mut("nodes").and_then(|n| n.as_array_mut()) {
            for node in nodes.iter_mut() {
                normalize_node(node);
            }
        }
        Ok(serde_json::from_value(json)?)
    }
}

const LIFTED_FIELDS: [&str; 4] = ["config", "label", "inputs", "outputs"];

const CONFIG_ALIASES: [(&str, &str); 4] = [
    ("max_tokens", "maxTokens"),
    ("output_schema", "outputSchema"),
    ("form_id", "formId"),
    ("submit_action", "submitAction"),
];

fn normalize_node(node: &mut serde_json::Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    if let Some(serde_json::Value::Object(mut data)) = obj.remove("data") {
        for field in ["label", "inputs", "outputs"] {
            if let Some(v) = data.remove(field) {
                obj.entry(field).or_insert(v);
            }
        }
        // Remaining data keys are config when no explicit config block exists.
        let lifted = match data.remove("config") {
            Some(config) => config,
            None => serde_json::Value::Object(
                data.into_iter()
                    .filter(|(k, _)| !LIFTED_FIELDS.contains(&k.as_str()))
                    .collect(),
            ),
        };
        let has_config = obj
            .get("config")
            .and_then(|c| c.as_object())
            .is_some_and(|c| !c.is_empty());
        if !has_config {
            obj.insert("config".to_string(), lifted);
        }
    }

    let node_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let config = obj
        .entry("config")
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    if config.is_null() {
        *config = serde_json::Value::Object(Default::default());
    }
    let Some(config) = config.as_object_mut() else {
        return;
    };

    for (alias, canonical) in CONFIG_ALIASES {
        if let Some(v) = config.remove(alias) {
            config.entry(canonical).or_insert(v);
        }
    }

    if let Some(op) = node_type.strip_prefix("db_") {
        if matches!(op, "select" | "insert" | "update" | "delete" | "migrate") {
            config
                .entry("operation")
                .or_insert_with(|| serde_json::Value::String(op.to_string()));
        }
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub position: Position,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: ValueMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub inputs: Vec<PortSpec>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub outputs: Vec<PortSpec>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole config map from a JSON object literal.
    pub fn with_config_json(mut self, config: serde_json::Value) -> Self {
        if let Value::Object(map) = Value::from(config) {
            self.config = map;
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn is_start(&self) -> bool {
        self.node_type == START_NODE_TYPE
    }

    pub fn is_end(&self) -> bool {
        self.node_type == END_NODE_TYPE
    }

    /// Label if set, otherwise the id.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Declared port. The type is advisory; the engine never checks it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub port_type: String,
}

/// Directed edge between two node ports. Empty handles mean the default port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    pub source: NodeId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source_handle: String,
    pub target: NodeId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_handle: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
}

/// Editor exports write `null` for unset fields.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, deserialize_with = "null_as_default")]
    pub x: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigExt;
    use serde_json::json;

    #[test]
    fn lifts_data_block_and_aliases() {
        let wf = Workflow::from_json_value(json!({
            "version": "1",
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "l", "type": "llm", "data": {
                    "label": "Writer",
                    "config": {"max_tokens": 512, "output_schema": {"type": "object"}}
                }},
                {"id": "d", "type": "db_insert", "data": {"table": "t"}}
            ],
            "edges": [{"id": "e1", "source": "s", "target": "l", "sourceHandle": null}]
        }))
        .unwrap();

        let llm = wf.find_node("l").unwrap();
        assert_eq!(llm.label, "Writer");
        assert_eq!(llm.config.get_i64_or("maxTokens", 0), 512);
        assert!(llm.config.contains_key("outputSchema"));
        assert!(!llm.config.contains_key("max_tokens"));

        let db = wf.find_node("d").unwrap();
        assert_eq!(db.config.get_str("operation"), Some("insert"));
        assert_eq!(db.config.get_str("table"), Some("t"));
        assert_eq!(wf.edges[0].source_handle, "");
    }

    #[test]
    fn null_node_fields_read_as_defaults() {
        let wf = Workflow::from_json_value(json!({
            "nodes": [
                {"id": "s", "type": "start", "label": null, "position": null,
                 "inputs": null, "outputs": null},
                {"id": "e", "type": "end", "position": {"x": 4.0, "y": null}}
            ],
            "edges": [{"id": "e1", "source": "s", "target": "e", "label": null}]
        }))
        .unwrap();

        let start = wf.find_node("s").unwrap();
        assert_eq!(start.label, "");
        assert_eq!(start.position.x, 0.0);
        assert!(start.inputs.is_empty() && start.outputs.is_empty());
        assert_eq!(wf.find_node("e").unwrap().position.x, 4.0);
    }
}
