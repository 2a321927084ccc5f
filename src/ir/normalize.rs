//! `normalize_document(document) -> (IR, warnings[])` — lowers a validated
//! [`Document`](crate::document::Document) into immutable IR, cross-
//! referencing every id and computing reachability from the entry node.
//! Fatal problems map to a stable `ERR_*` code via [`IrError`]; everything
//! recoverable becomes a [`NormalizationWarning`] instead.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{GraphError, IrError, Result};

use super::model::*;

pub fn normalize_document(document: &Document) -> Result<NormalizationResult> {
    let mut warnings = Vec::new();

    let runtime = normalize_runtime(document)?;
    let providers = normalize_providers(document);
    normalize_tools_refs(document, &providers)?;
    let tools = normalize_tools(document);
    let components = normalize_components(document, &providers, &runtime, &mut warnings)?;
    validate_component_refs(&components, &tools)?;
    let graph = normalize_graph(document, &components, &mut warnings)?;
    let histories = normalize_histories(document, &mut warnings);
    let policies = document.policies.clone();

    let ir = Ir {
        version: document.meta.version.clone(),
        runtime,
        providers,
        tools,
        components,
        graph,
        policies,
        histories,
    };

    Ok(NormalizationResult { ir, warnings })
}

fn normalize_runtime(document: &Document) -> Result<NormalizedRuntime> {
    let default_provider = document.runtime.defaults.provider.clone();
    if let Some(provider_id) = &default_provider {
        if !document.providers.iter().any(|p| &p.id == provider_id) {
            return Err(GraphError::Ir(IrError::new(
                "ERR_PROVIDER_DEFAULT_MISSING",
                format!("runtime.defaults.provider '{provider_id}' is not a defined provider"),
                "/runtime/defaults/provider",
            )));
        }
    }
    Ok(NormalizedRuntime {
        engine: document.runtime.engine.clone(),
        default_provider,
    })
}

fn normalize_providers(document: &Document) -> HashMap<String, NormalizedProvider> {
    document
        .providers
        .iter()
        .map(|p| {
            (
                p.id.clone(),
                NormalizedProvider {
                    id: p.id.clone(),
                    kind: p.kind.clone(),
                    config: p.config.clone(),
                },
            )
        })
        .collect()
}

fn normalize_tools_refs(document: &Document, providers: &HashMap<String, NormalizedProvider>) -> Result<()> {
    for tool in &document.tools {
        if let Some(provider_id) = &tool.provider {
            if !providers.contains_key(provider_id) {
                return Err(GraphError::Ir(IrError::new(
                    "ERR_TOOL_PROVIDER_MISSING",
                    format!("tool '{}' references undefined provider '{}'", tool.id, provider_id),
                    format!("/tools/{}/provider", tool.id),
                )));
            }
        }
    }
    Ok(())
}

fn normalize_tools(document: &Document) -> HashMap<String, NormalizedTool> {
    document
        .tools
        .iter()
        .map(|t| {
            (
                t.id.clone(),
                NormalizedTool {
                    id: t.id.clone(),
                    kind: t.kind.clone(),
                    provider_id: t.provider.clone(),
                    config: t.config.clone(),
                },
            )
        })
        .collect()
}

fn normalize_components(
    document: &Document,
    providers: &HashMap<String, NormalizedProvider>,
    runtime: &NormalizedRuntime,
    warnings: &mut Vec<NormalizationWarning>,
) -> Result<HashMap<String, NormalizedComponent>> {
    let mut out = HashMap::new();
    for c in &document.components {
        let provider_id = match &c.provider {
            Some(pid) => {
                if !providers.contains_key(pid) {
                    return Err(GraphError::Ir(IrError::new(
                        "ERR_COMPONENT_PROVIDER_MISSING",
                        format!("component '{}' references undefined provider '{}'", c.id, pid),
                        format!("/components/{}/provider", c.id),
                    )));
                }
                Some(pid.clone())
            }
            None => {
                let inherited = runtime.default_provider.clone();
                if inherited.is_none() {
                    warnings.push(NormalizationWarning {
                        code: "WARN_COMPONENT_NO_PROVIDER".into(),
                        message: format!(
                            "component '{}' has no provider and no runtime default; it cannot back llm/tool nodes",
                            c.id
                        ),
                        pointer: format!("/components/{}", c.id),
                    });
                }
                inherited
            }
        };

        if c.inputs.is_empty() {
            warnings.push(NormalizationWarning {
                code: "WARN_COMPONENT_EMPTY_INPUTS".into(),
                message: format!("component '{}' declares no inputs", c.id),
                pointer: format!("/components/{}/inputs", c.id),
            });
        }
        if c.outputs.is_empty() {
            warnings.push(NormalizationWarning {
                code: "WARN_COMPONENT_EMPTY_OUTPUTS".into(),
                message: format!("component '{}' declares no outputs", c.id),
                pointer: format!("/components/{}/outputs", c.id),
            });
        }

        out.insert(
            c.id.clone(),
            NormalizedComponent {
                id: c.id.clone(),
                kind: c.kind.clone(),
                provider_id,
                tool_id: c.tool.clone(),
                inputs: c.inputs.clone(),
                outputs: c.outputs.clone(),
                config: c.config.clone(),
            },
        );
    }
    Ok(out)
}

fn validate_component_refs(
    components: &HashMap<String, NormalizedComponent>,
    tools: &HashMap<String, NormalizedTool>,
) -> Result<()> {
    for c in components.values() {
        if let Some(tool_id) = &c.tool_id {
            if !tools.contains_key(tool_id) {
                return Err(GraphError::Ir(IrError::new(
                    "ERR_COMPONENT_TOOL_NOT_FOUND",
                    format!("component '{}' references undefined tool '{}'", c.id, tool_id),
                    format!("/components/{}/tool", c.id),
                )));
            }
        }
    }
    Ok(())
}

fn normalize_graph(
    document: &Document,
    components: &HashMap<String, NormalizedComponent>,
    warnings: &mut Vec<NormalizationWarning>,
) -> Result<NormalizedGraph> {
    let entry_id = document.graph.entry.clone();
    if !document.graph.nodes.contains_key(&entry_id) {
        return Err(GraphError::Ir(IrError::new(
            "ERR_GRAPH_ENTRY_NOT_FOUND",
            format!("graph entry '{entry_id}' is not a defined node"),
            "/graph/entry",
        )));
    }

    let mut nodes = HashMap::new();
    for (id, node_doc) in &document.graph.nodes {
        if let Some(component_id) = &node_doc.component {
            if !components.contains_key(component_id) {
                return Err(GraphError::Ir(IrError::new(
                    "ERR_NODE_COMPONENT_NOT_FOUND",
                    format!("node '{id}' references undefined component '{component_id}'"),
                    format!("/graph/nodes/{id}/component"),
                )));
            }
        }

        let (next_nodes, routes) = extract_targets(node_doc.next.as_ref());

        nodes.insert(
            id.clone(),
            NormalizedGraphNode {
                id: id.clone(),
                declared_kind: node_doc.kind.clone(),
                component_id: node_doc.component.clone(),
                next_nodes,
                routes,
                inputs: node_doc.inputs.clone(),
                outputs: node_doc.outputs.clone(),
                config: node_doc.config.clone(),
                pointer: format!("/graph/nodes/{id}"),
            },
        );
    }

    for (id, node) in &nodes {
        for target in &node.next_nodes {
            if !nodes.contains_key(target) {
                return Err(GraphError::Ir(IrError::new(
                    "ERR_EDGE_ENDPOINT_INVALID",
                    format!("node '{id}' has an edge to undefined node '{target}'"),
                    format!("/graph/nodes/{id}/next"),
                )));
            }
        }
        for (discriminant, target) in &node.routes {
            if !nodes.contains_key(target) {
                return Err(GraphError::Ir(IrError::new(
                    "ERR_EDGE_ENDPOINT_INVALID",
                    format!("node '{id}' route '{discriminant}' targets undefined node '{target}'"),
                    format!("/graph/nodes/{id}/next/{discriminant}"),
                )));
            }
        }
    }

    let mut outputs = Vec::new();
    for o in &document.graph.outputs {
        let node = nodes.get(&o.node).ok_or_else(|| {
            GraphError::Ir(IrError::new(
                "ERR_GRAPH_OUTPUT_NODE_MISSING",
                format!("graph output '{}' references undefined node '{}'", o.key, o.node),
                format!("/graph/outputs/{}", o.key),
            ))
        })?;
        if !node.outputs.contains_key(&o.output) && !node.outputs.is_empty() {
            warnings.push(NormalizationWarning {
                code: "WARN_GRAPH_OUTPUT_UNDECLARED".into(),
                message: format!(
                    "graph output '{}' references output '{}' not declared on node '{}'",
                    o.key, o.output, o.node
                ),
                pointer: format!("/graph/outputs/{}", o.key),
            });
        }
        outputs.push(NormalizedGraphOutput {
            key: o.key.clone(),
            node_id: o.node.clone(),
            output: o.output.clone(),
        });
    }

    let reachable = collect_reachable(&entry_id, &nodes);
    for id in nodes.keys() {
        if !reachable.contains(id) {
            warnings.push(NormalizationWarning {
                code: "WARN_NODE_UNREACHABLE".into(),
                message: format!("node '{id}' is not reachable from entry '{entry_id}'"),
                pointer: format!("/graph/nodes/{id}"),
            });
        }
    }

    Ok(NormalizedGraph { entry_id, nodes, outputs })
}

/// `next` is overloaded on the wire: a scalar/list names direct successors,
/// a mapping names router routes.
fn extract_targets(next: Option<&JsonValue>) -> (Vec<String>, HashMap<String, String>) {
    match next {
        None => (Vec::new(), HashMap::new()),
        Some(JsonValue::String(s)) => (vec![s.clone()], HashMap::new()),
        Some(JsonValue::Array(items)) => {
            let list = items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            (list, HashMap::new())
        }
        Some(JsonValue::Object(map)) => {
            let routes: HashMap<String, String> = map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            (Vec::new(), routes)
        }
        Some(_) => (Vec::new(), HashMap::new()),
    }
}

fn collect_reachable(entry_id: &str, nodes: &HashMap<String, NormalizedGraphNode>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(entry_id.to_string());
    seen.insert(entry_id.to_string());
    while let Some(id) = queue.pop_front() {
        let Some(node) = nodes.get(&id) else { continue };
        let mut successors: Vec<&String> = node.next_nodes.iter().collect();
        successors.extend(node.routes.values());
        for next in successors {
            if seen.insert(next.clone()) {
                queue.push_back(next.clone());
            }
        }
    }
    seen
}

fn normalize_histories(document: &Document, _warnings: &mut [NormalizationWarning]) -> HashMap<String, NormalizedHistory> {
    document
        .histories
        .iter()
        .map(|h| {
            (
                h.id.clone(),
                NormalizedHistory {
                    id: h.id.clone(),
                    backend: h.backend.clone(),
                    config: h.config.clone(),
                },
            )
        })
        .collect()
}
