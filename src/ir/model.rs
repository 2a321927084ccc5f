//! L1 — immutable IR entities produced by [`super::normalize::normalize_document`].

use std::collections::HashMap;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
pub struct NormalizedProvider {
    pub id: String,
    pub kind: String,
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone)]
pub struct NormalizedTool {
    pub id: String,
    pub kind: String,
    pub provider_id: Option<String>,
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone)]
pub struct NormalizedComponent {
    pub id: String,
    pub kind: String,
    pub provider_id: Option<String>,
    pub tool_id: Option<String>,
    pub inputs: HashMap<String, JsonValue>,
    pub outputs: HashMap<String, JsonValue>,
    pub config: HashMap<String, JsonValue>,
}

/// `kind` ∈ {`component`, `llm`, `tool`, `router`, `map`, `parallel`}; see
/// the builder's kind-inference rule in `graph::builder`.
#[derive(Debug, Clone)]
pub struct NormalizedGraphNode {
    pub id: String,
    pub declared_kind: Option<String>,
    pub component_id: Option<String>,
    pub next_nodes: Vec<String>,
    pub routes: HashMap<String, String>,
    pub inputs: HashMap<String, JsonValue>,
    pub outputs: HashMap<String, JsonValue>,
    pub config: HashMap<String, JsonValue>,
    pub pointer: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedGraphOutput {
    pub key: String,
    pub node_id: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedHistory {
    pub id: String,
    pub backend: String,
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone)]
pub struct NormalizedGraph {
    pub entry_id: String,
    pub nodes: HashMap<String, NormalizedGraphNode>,
    pub outputs: Vec<NormalizedGraphOutput>,
}

#[derive(Debug, Clone)]
pub struct NormalizedRuntime {
    pub engine: String,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Ir {
    pub version: Option<String>,
    pub runtime: NormalizedRuntime,
    pub providers: HashMap<String, NormalizedProvider>,
    pub tools: HashMap<String, NormalizedTool>,
    pub components: HashMap<String, NormalizedComponent>,
    pub graph: NormalizedGraph,
    pub policies: HashMap<String, JsonValue>,
    pub histories: HashMap<String, NormalizedHistory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationWarning {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

#[derive(Debug, Clone)]
pub struct NormalizationResult {
    pub ir: Ir,
    pub warnings: Vec<NormalizationWarning>,
}
