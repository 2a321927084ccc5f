//! L0 — document model.
//!
//! Parses the YAML wire format into a [`Document`] tree and runs domain
//! validation (unique ids, allowed engine, duplicate-key rejection) ahead of
//! IR normalization. Location tracking is intentionally coarse: `serde_yaml`
//! does not preserve per-node marks the way a hand-rolled composer would, so
//! this loader reports line/column only when `serde_yaml`'s own parse error
//! carries one; domain-check issues report a JSON-pointer only.

use std::collections::HashMap;

use serde::de;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DocumentError, GraphError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub meta: Meta,
    pub runtime: RuntimeBlock,
    #[serde(default)]
    pub providers: Vec<ProviderDoc>,
    #[serde(default)]
    pub tools: Vec<ToolDoc>,
    #[serde(default)]
    pub components: Vec<ComponentDoc>,
    pub graph: GraphDoc,
    #[serde(default)]
    pub policies: HashMap<String, JsonValue>,
    #[serde(default)]
    pub histories: Vec<HistoryDoc>,
    /// Legacy pre-v2 field; accepted with `WARN_LEGACY_ERROR_POLICY`.
    #[serde(default, rename = "error_policy")]
    pub legacy_error_policy: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeBlock {
    pub engine: String,
    #[serde(default)]
    pub defaults: RuntimeDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, JsonValue>,
    #[serde(default)]
    pub outputs: HashMap<String, JsonValue>,
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDoc {
    pub entry: String,
    pub nodes: HashMap<String, NodeDoc>,
    #[serde(default)]
    pub outputs: Vec<GraphOutputDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    /// Overloaded: scalar/list of successor ids, or a discriminant→id map
    /// for router nodes.
    #[serde(default)]
    pub next: Option<JsonValue>,
    #[serde(default)]
    pub inputs: HashMap<String, JsonValue>,
    #[serde(default)]
    pub outputs: HashMap<String, JsonValue>,
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOutputDoc {
    pub key: String,
    pub node: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDoc {
    pub id: String,
    #[serde(default = "default_history_backend")]
    pub backend: String,
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

fn default_history_backend() -> String {
    "memory".to_string()
}

/// A single non-fatal diagnostic surfaced during loading or normalization.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

const DEFAULT_ALLOWED_ENGINES: &[&str] = &["lc.lcel"];

pub struct DocumentLoader {
    allowed_engines: Vec<String>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self {
            allowed_engines: DEFAULT_ALLOWED_ENGINES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DocumentLoader {
    pub fn with_allowed_engines(engines: impl IntoIterator<Item = String>) -> Result<Self> {
        let allowed_engines: Vec<String> = engines.into_iter().collect();
        if allowed_engines.is_empty() {
            return Err(GraphError::Document(DocumentError::Generic {
                code: "ERR_ALLOWED_ENGINES_EMPTY".into(),
                message: "allowed_runtime_engines must not be empty".into(),
                pointer: "/".into(),
            }));
        }
        Ok(Self { allowed_engines })
    }

    pub fn load_str(&self, yaml: &str) -> std::result::Result<(Document, Vec<ValidationIssue>), GraphError> {
        if yaml.trim().is_empty() {
            return Err(GraphError::Document(DocumentError::Generic {
                code: "ERR_YAML_EMPTY".into(),
                message: "YAML document is empty".into(),
                pointer: "/".into(),
            }));
        }
        self.reject_duplicate_keys(yaml)?;

        #[cfg(feature = "json-validation")]
        {
            let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
            let as_json = serde_json::to_value(&raw).map_err(|e| {
                GraphError::Document(DocumentError::Generic {
                    code: "ERR_SCHEMA_VALIDATION".into(),
                    message: e.to_string(),
                    pointer: "/".into(),
                })
            })?;
            schema::validate(&as_json)?;
        }

        let document: Document = serde_yaml::from_str(yaml)?;
        let mut issues = Vec::new();
        self.validate_domains(&document, &mut issues)?;
        Ok((document, issues))
    }

    pub fn load_file(&self, path: impl AsRef<std::path::Path>) -> std::result::Result<(Document, Vec<ValidationIssue>), GraphError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GraphError::Document(DocumentError::Generic {
                code: "ERR_YAML_IO".into(),
                message: e.to_string(),
                pointer: "/".into(),
            })
        })?;
        self.load_str(&text)
    }

    /// `serde_yaml::Value` silently keeps the last of duplicate mapping
    /// keys; a custom visitor walks the raw event stream (which does not
    /// collapse duplicates on its own) so they can be rejected up front.
    fn reject_duplicate_keys(&self, yaml: &str) -> Result<()> {
        let de = serde_yaml::Deserializer::from_str(yaml);
        serde::de::DeserializeSeed::deserialize(DupKeyCheckerSeed, de).map_err(|e: serde_yaml::Error| {
            GraphError::Document(DocumentError::Generic {
                code: "ERR_YAML_DUPLICATE_KEY".into(),
                message: e.to_string(),
                pointer: "/".into(),
            })
        })
    }

    fn validate_domains(&self, document: &Document, issues: &mut Vec<ValidationIssue>) -> Result<()> {
        if !self.allowed_engines.iter().any(|e| e == &document.runtime.engine) {
            return Err(GraphError::Document(DocumentError::Generic {
                code: "ERR_RUNTIME_ENGINE_UNSUPPORTED".into(),
                message: format!(
                    "unsupported runtime engine '{}': allowed engines are {:?}",
                    document.runtime.engine, self.allowed_engines
                ),
                pointer: "/runtime/engine".into(),
            }));
        }

        assert_unique_ids(document.providers.iter().map(|p| p.id.as_str()), "/providers", "ERR_PROVIDER_DUP")?;
        assert_unique_ids(document.tools.iter().map(|t| t.id.as_str()), "/tools", "ERR_TOOL_DUP")?;
        assert_unique_ids(document.components.iter().map(|c| c.id.as_str()), "/components", "ERR_COMPONENT_DUP")?;
        assert_unique_ids(document.histories.iter().map(|h| h.id.as_str()), "/histories", "ERR_HISTORY_DUP")?;
        // graph.nodes is already a map, so duplicate node ids can't arise
        // from the wire format; node-id uniqueness is therefore implicit.

        if document.legacy_error_policy.is_some() {
            issues.push(ValidationIssue {
                code: "WARN_LEGACY_ERROR_POLICY".into(),
                message: "top-level 'error_policy' is deprecated; use policies.retry instead".into(),
                pointer: "/error_policy".into(),
            });
        }

        Ok(())
    }
}

/// Optional JSON Schema (Draft 2020-12) pass, run before domain checks when
/// the `json-validation` feature is enabled. Catches structurally malformed
/// documents (wrong types, missing required top-level keys) with a stable
/// `ERR_SCHEMA_VALIDATION` code and a JSON pointer to the first violation,
/// picking the shallowest-pointer error when several fire at once.
#[cfg(feature = "json-validation")]
mod schema {
    use std::sync::OnceLock;

    use serde_json::{json, Value as JsonValue};

    use crate::error::{DocumentError, GraphError, Result};

    fn document_schema() -> &'static JsonValue {
        static SCHEMA: OnceLock<JsonValue> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            json!({
                "$schema": "https://json-schema.org/draft/2020-12/schema",
                "type": "object",
                "required": ["meta", "runtime", "graph"],
                "properties": {
                    "meta": { "type": "object" },
                    "runtime": {
                        "type": "object",
                        "required": ["engine"],
                        "properties": { "engine": { "type": "string" } }
                    },
                    "providers": { "type": "array" },
                    "tools": { "type": "array" },
                    "components": { "type": "array" },
                    "graph": {
                        "type": "object",
                        "required": ["entry", "nodes"],
                        "properties": {
                            "entry": { "type": "string" },
                            "nodes": { "type": "object" }
                        }
                    },
                    "policies": { "type": "object" },
                    "histories": { "type": "array" }
                }
            })
        })
    }

    pub fn validate(instance: &JsonValue) -> Result<()> {
        let compiled = jsonschema::JSONSchema::compile(document_schema())
            .expect("document schema is a valid Draft 2020-12 schema");
        let mut violations: Vec<(usize, String, String)> = Vec::new();
        if let Err(errors) = compiled.validate(instance) {
            for error in errors {
                let pointer = error.instance_path.to_string();
                let depth = pointer.matches('/').count();
                violations.push((depth, pointer, error.to_string()));
            }
        }
        if let Some((_, pointer, message)) = violations.into_iter().min_by_key(|(depth, _, _)| *depth) {
            return Err(GraphError::Document(DocumentError::Generic {
                code: "ERR_SCHEMA_VALIDATION".into(),
                message,
                pointer: if pointer.is_empty() { "/".into() } else { pointer },
            }));
        }
        Ok(())
    }
}

fn assert_unique_ids<'a>(ids: impl Iterator<Item = &'a str>, pointer_prefix: &str, code: &str) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(GraphError::Document(DocumentError::Generic {
                code: code.into(),
                message: format!("duplicate id '{id}'"),
                pointer: format!("{pointer_prefix}/{id}"),
            }));
        }
    }
    Ok(())
}

/// Walks a YAML value tree purely to detect duplicate mapping keys.
/// `MapAccess::next_key` yields every key in document order without
/// collapsing duplicates the way deserializing straight into a `HashMap`
/// would, so a hand-written visitor is the only way to see them.
struct DupKeyCheckerSeed;

impl<'de> de::DeserializeSeed<'de> for DupKeyCheckerSeed {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(DupKeyCheckerVisitor)
    }
}

struct DupKeyCheckerVisitor;

impl<'de> de::Visitor<'de> for DupKeyCheckerVisitor {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("any YAML value")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let mut seen = std::collections::HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("duplicate key '{key}' encountered")));
            }
            map.next_value_seed(DupKeyCheckerSeed)?;
        }
        Ok(())
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        while seq.next_element_seed(DupKeyCheckerSeed)?.is_some() {}
        Ok(())
    }

    fn visit_bool<E>(self, _v: bool) -> std::result::Result<(), E> { Ok(()) }
    fn visit_i64<E>(self, _v: i64) -> std::result::Result<(), E> { Ok(()) }
    fn visit_u64<E>(self, _v: u64) -> std::result::Result<(), E> { Ok(()) }
    fn visit_f64<E>(self, _v: f64) -> std::result::Result<(), E> { Ok(()) }
    fn visit_str<E>(self, _v: &str) -> std::result::Result<(), E> { Ok(()) }
    fn visit_string<E>(self, _v: String) -> std::result::Result<(), E> { Ok(()) }
    fn visit_unit<E>(self) -> std::result::Result<(), E> { Ok(()) }
    fn visit_none<E>(self) -> std::result::Result<(), E> { Ok(()) }
    fn visit_some<D>(self, d: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        d.deserialize_any(DupKeyCheckerVisitor)
    }
}
