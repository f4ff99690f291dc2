//! Workflow graph templates.
//!
//! A template is a ComfyUI API-format graph exported to
//! `<templates_dir>/<name>.json`: an object mapping node ids to
//! `{class_type, inputs, ...}`. A node's `class_type` is its role.
//!
//! Jobs never mutate a template. [`build`] copies it and writes job
//! parameters into the inputs of nodes whose role is bound, after
//! checking every binding against the workflow's [`RoleSchema`].
//! [`validate`] then checks the structural rules ComfyUI relies on
//! before anything is sent to it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Errors raised while loading, building or validating a workflow graph.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("workflow template not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {name} is not a JSON object of nodes: {reason}")]
    Parse { name: String, reason: String },

    #[error("role {role} is not declared for workflow {workflow}")]
    UnknownRole { workflow: String, role: String },

    #[error("field {field} is not substitutable on role {role} in workflow {workflow}")]
    IneligibleField {
        workflow: String,
        role: String,
        field: String,
    },

    #[error("{0}")]
    Validation(String),
}

impl TemplateError {
    /// Short machine-readable kind of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TemplateNotFound",
            Self::Io { .. } => "Io",
            Self::Parse { .. } => "TemplateParse",
            Self::UnknownRole { .. } => "UnknownRole",
            Self::IneligibleField { .. } => "IneligibleField",
            Self::Validation(_) => "ValidationError",
        }
    }
}

/// Directory of `<name>.json` workflow templates.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read and parse the template called `name`.
    ///
    /// Templates are re-read on every call so operators can replace a
    /// workflow export without restarting the worker.
    pub async fn load(&self, name: &str) -> Result<GraphTemplate, TemplateError> {
        let path = self.dir.join(format!("{name}.json"));

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(path = %path.display(), "Workflow template missing; export it from ComfyUI in API format");
                return Err(TemplateError::NotFound(path));
            }
            Err(source) => return Err(TemplateError::Io { path, source }),
        };

        let value: Value = serde_json::from_slice(&raw).map_err(|e| TemplateError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let template = GraphTemplate::from_value(name, value)?;
        tracing::debug!(template = %name, nodes = template.node_count(), "Loaded workflow template");
        Ok(template)
    }
}

/// An immutable workflow prototype.
#[derive(Debug, Clone)]
pub struct GraphTemplate {
    name: String,
    nodes: Map<String, Value>,
}

impl GraphTemplate {
    /// Wrap an already parsed template. The value must be a JSON object.
    pub fn from_value(name: &str, value: Value) -> Result<Self, TemplateError> {
        match value {
            Value::Object(nodes) => Ok(Self {
                name: name.to_string(),
                nodes,
            }),
            other => Err(TemplateError::Parse {
                name: name.to_string(),
                reason: format!("expected an object, found {}", json_type(&other)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Distinct roles (`class_type` values) present in the template.
    pub fn roles(&self) -> BTreeSet<&str> {
        self.nodes.values().filter_map(node_role).collect()
    }
}

/// Roles of one workflow and the input fields that may be substituted
/// on each.
#[derive(Debug, Clone)]
pub struct RoleSchema {
    workflow: &'static str,
    roles: BTreeMap<&'static str, &'static [&'static str]>,
}

impl RoleSchema {
    pub fn new(workflow: &'static str, roles: &[(&'static str, &'static [&'static str])]) -> Self {
        Self {
            workflow,
            roles: roles.iter().copied().collect(),
        }
    }

    pub fn workflow(&self) -> &'static str {
        self.workflow
    }

    /// Eligible fields of `role`, or `None` if the role is not declared.
    pub fn fields(&self, role: &str) -> Option<&'static [&'static str]> {
        self.roles.get(role).copied()
    }

    fn check(&self, bindings: &RoleBindings) -> Result<(), TemplateError> {
        for (role, fields) in &bindings.roles {
            let eligible = self.fields(role).ok_or_else(|| TemplateError::UnknownRole {
                workflow: self.workflow.to_string(),
                role: role.clone(),
            })?;
            if let Some(field) = fields.keys().find(|f| !eligible.contains(&f.as_str())) {
                return Err(TemplateError::IneligibleField {
                    workflow: self.workflow.to_string(),
                    role: role.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Job parameters keyed by role, then by input field.
#[derive(Debug, Clone, Default)]
pub struct RoleBindings {
    roles: BTreeMap<String, Map<String, Value>>,
}

impl RoleBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set).
    pub fn bind(mut self, role: &str, field: &str, value: impl Into<Value>) -> Self {
        self.set(role, field, value);
        self
    }

    /// Bind `field` on every node of `role` to `value`.
    pub fn set(&mut self, role: &str, field: &str, value: impl Into<Value>) {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// A fully specified graph ready for submission.
///
/// Node ids and input keys are kept sorted, so serialization is
/// deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph(Map<String, Value>);

impl WorkflowGraph {
    pub fn from_nodes(nodes: Map<String, Value>) -> Self {
        Self(nodes)
    }

    pub fn node_count(&self) -> usize {
        self.0.len()
    }

    pub fn node(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    /// Whether any node has `class_type == role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.0.values().any(|node| node_role(node) == Some(role))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Produce a graph from `template` with `bindings` substituted.
///
/// Every bound role must be declared by `schema` and every bound field
/// must be eligible for its role. A declared role that the template
/// does not contain is skipped, so one binding set can serve several
/// variants of a workflow.
pub fn build(
    template: &GraphTemplate,
    schema: &RoleSchema,
    bindings: &RoleBindings,
) -> Result<WorkflowGraph, TemplateError> {
    schema.check(bindings)?;

    let present = template.roles();
    for role in bindings.roles.keys() {
        if !present.contains(role.as_str()) {
            tracing::debug!(template = %template.name, role = %role, "Role not in template, binding skipped");
        }
    }

    let mut nodes = template.nodes.clone();
    let mut substituted = 0usize;
    for node in nodes.values_mut() {
        let Some(fields) = node_role(node).and_then(|role| bindings.roles.get(role)) else {
            continue;
        };
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            // Left for validate() to report.
            continue;
        };
        for (field, value) in fields {
            inputs.insert(field.clone(), value.clone());
            substituted += 1;
        }
    }

    tracing::debug!(
        template = %template.name,
        nodes = nodes.len(),
        substituted,
        "Workflow graph built",
    );

    Ok(WorkflowGraph(nodes))
}

/// Check the structural rules of a graph.
///
/// The graph must have at least one node, and every node must be an
/// object with a non-empty string `class_type` and an object `inputs`.
pub fn validate(graph: &WorkflowGraph) -> Result<(), TemplateError> {
    if graph.0.is_empty() {
        return Err(TemplateError::Validation("workflow has no nodes".into()));
    }

    for (id, node) in &graph.0 {
        let Some(fields) = node.as_object() else {
            return Err(TemplateError::Validation(format!("node {id} is not an object")));
        };
        match fields.get("class_type").and_then(Value::as_str) {
            Some(role) if !role.is_empty() => {}
            _ => {
                return Err(TemplateError::Validation(format!(
                    "node {id} is missing class_type"
                )))
            }
        }
        if !fields.get("inputs").is_some_and(Value::is_object) {
            return Err(TemplateError::Validation(format!(
                "node {id} is missing an inputs object"
            )));
        }
    }

    Ok(())
}

fn node_role(node: &Value) -> Option<&str> {
    node.get("class_type").and_then(Value::as_str)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn schema() -> RoleSchema {
        RoleSchema::new(
            "test",
            &[
                ("LoadImage", &["image"]),
                ("CLIPTextEncode", &["text"]),
                ("KSampler", &["seed", "cfg", "steps"]),
                ("VHS_VideoCombine", &["frame_rate"]),
            ],
        )
    }

    fn template() -> GraphTemplate {
        GraphTemplate::from_value(
            "test",
            json!({
                "1": {"class_type": "LoadImage", "inputs": {"image": "placeholder.png"}},
                "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 0]}},
                "3": {"class_type": "KSampler", "inputs": {"seed": 0, "cfg": 1.0, "steps": 1, "sampler_name": "euler"}},
                "4": {"class_type": "CLIPLoader", "inputs": {"clip_name": "t5.safetensors"}, "_meta": {"title": "clip"}}
            }),
        )
        .unwrap()
    }

    #[test]
    fn bound_fields_are_written_and_others_kept() {
        let bindings = RoleBindings::new()
            .bind("LoadImage", "image", "uploaded.png")
            .bind("CLIPTextEncode", "text", "a cat")
            .bind("KSampler", "seed", 42)
            .bind("KSampler", "cfg", 7.0);

        let graph = build(&template(), &schema(), &bindings).unwrap();

        assert_eq!(graph.node("1").unwrap()["inputs"]["image"], "uploaded.png");
        assert_eq!(graph.node("2").unwrap()["inputs"]["text"], "a cat");
        assert_eq!(graph.node("2").unwrap()["inputs"]["clip"], json!(["4", 0]));
        let sampler = &graph.node("3").unwrap()["inputs"];
        assert_eq!(sampler["seed"], 42);
        assert_eq!(sampler["cfg"], 7.0);
        assert_eq!(sampler["steps"], 1);
        assert_eq!(sampler["sampler_name"], "euler");
        assert_eq!(graph.node("4"), template().nodes.get("4"));
    }

    #[test]
    fn build_does_not_touch_the_template() {
        let template = template();
        let bindings = RoleBindings::new().bind("CLIPTextEncode", "text", "changed");

        build(&template, &schema(), &bindings).unwrap();

        assert_eq!(template.nodes["2"]["inputs"]["text"], "");
    }

    #[test]
    fn built_graph_reports_present_roles() {
        let graph = build(&template(), &schema(), &RoleBindings::new()).unwrap();

        assert!(graph.has_role("KSampler"));
        assert!(!graph.has_role("LoadImageMask"));
    }

    #[test]
    fn build_is_deterministic() {
        let bindings = RoleBindings::new()
            .bind("KSampler", "steps", 20)
            .bind("LoadImage", "image", "x.png");

        let a = serde_json::to_string(&build(&template(), &schema(), &bindings).unwrap().into_value()).unwrap();
        let b = serde_json::to_string(&build(&template(), &schema(), &bindings).unwrap().into_value()).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn undeclared_role_is_rejected() {
        let bindings = RoleBindings::new().bind("KSamplerAdvanced", "seed", 1);

        assert_matches!(
            build(&template(), &schema(), &bindings),
            Err(TemplateError::UnknownRole { role, .. }) if role == "KSamplerAdvanced"
        );
    }

    #[test]
    fn ineligible_field_is_rejected() {
        let bindings = RoleBindings::new().bind("KSampler", "sampler_name", "dpmpp_2m");

        let err = build(&template(), &schema(), &bindings).unwrap_err();

        assert_eq!(err.kind(), "IneligibleField");
        assert_matches!(err, TemplateError::IneligibleField { field, .. } if field == "sampler_name");
    }

    #[test]
    fn declared_role_missing_from_template_is_skipped() {
        let bindings = RoleBindings::new()
            .bind("VHS_VideoCombine", "frame_rate", 8)
            .bind("CLIPTextEncode", "text", "hello");

        let graph = build(&template(), &schema(), &bindings).unwrap();

        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.node("2").unwrap()["inputs"]["text"], "hello");
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let graph = build(&template(), &schema(), &RoleBindings::new()).unwrap();
        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn validate_rejects_empty_graph() {
        let err = validate(&WorkflowGraph::from_nodes(Map::new())).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn validate_rejects_nodes_missing_role_or_inputs() {
        let cases = [
            json!({"1": {"inputs": {}}}),
            json!({"1": {"class_type": "", "inputs": {}}}),
            json!({"1": {"class_type": "SaveImage"}}),
            json!({"1": {"class_type": "SaveImage", "inputs": []}}),
            json!({"1": "SaveImage"}),
        ];
        for case in cases {
            let Value::Object(nodes) = case else { unreachable!() };
            let graph = WorkflowGraph::from_nodes(nodes);
            assert_matches!(validate(&graph), Err(TemplateError::Validation(_)), "{graph:?}");
        }
    }

    #[test]
    fn non_object_template_is_parse_error() {
        assert_matches!(
            GraphTemplate::from_value("bad", json!([1, 2])),
            Err(TemplateError::Parse { .. })
        );
    }

    #[tokio::test]
    async fn store_loads_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("i2v.json"),
            r#"{"1": {"class_type": "LoadImage", "inputs": {"image": ""}}}"#,
        )
        .unwrap();
        let store = TemplateStore::new(dir.path());

        let template = store.load("i2v").await.unwrap();

        assert_eq!(template.name(), "i2v");
        assert_eq!(template.node_count(), 1);
        assert!(template.roles().contains("LoadImage"));
    }

    #[tokio::test]
    async fn store_reports_missing_and_unparseable_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let store = TemplateStore::new(dir.path());

        let missing = store.load("qwen").await.unwrap_err();
        assert_eq!(missing.kind(), "TemplateNotFound");
        assert_matches!(missing, TemplateError::NotFound(path) if path.ends_with("qwen.json"));

        assert_eq!(store.load("broken").await.unwrap_err().kind(), "TemplateParse");
    }
}
