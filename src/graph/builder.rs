//! Composes normalized IR plus resolved runtime objects into an executable
//! [`GraphDefinition`], inferring each node's kind and checking the
//! preconditions that its kind demands.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{BuildError, GraphError, Result};
use crate::ir::{Ir, NormalizedComponent, NormalizedGraphNode, NormalizedGraphOutput, NormalizedHistory};
use crate::registry::{Component, Resolved};

const SUPPORTED_KINDS: [&str; 6] = ["component", "llm", "tool", "router", "map", "parallel"];

#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
    pub pointer: String,
    pub component_id: Option<String>,
    pub component: Option<Arc<dyn Component>>,
    pub component_meta: Option<NormalizedComponent>,
    pub inputs: HashMap<String, JsonValue>,
    pub outputs: HashMap<String, JsonValue>,
    pub routes: HashMap<String, String>,
    pub next_nodes: Vec<String>,
    pub config: HashMap<String, JsonValue>,
}

pub struct GraphDefinition {
    pub name: Option<String>,
    pub entrypoint: String,
    pub nodes: HashMap<String, NodeSpec>,
    pub outputs: Vec<NormalizedGraphOutput>,
    pub policies: HashMap<String, JsonValue>,
    pub histories: HashMap<String, NormalizedHistory>,
}

#[derive(Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, ir: &Ir, resolved: &Resolved) -> Result<GraphDefinition> {
        if !ir.graph.nodes.contains_key(&ir.graph.entry_id) {
            return Err(GraphError::Build(BuildError::new(
                "ERR_GRAPH_ENTRY_NOT_FOUND",
                format!("graph entry '{}' does not exist", ir.graph.entry_id),
                "/graph/entry",
            )));
        }

        let mut nodes = HashMap::new();
        for (node_id, node) in &ir.graph.nodes {
            nodes.insert(node_id.clone(), self.build_node(node, ir, resolved)?);
        }

        Ok(GraphDefinition {
            name: Some(ir.runtime.engine.clone()),
            entrypoint: ir.graph.entry_id.clone(),
            nodes,
            outputs: ir.graph.outputs.clone(),
            policies: ir.policies.clone(),
            histories: ir.histories.clone(),
        })
    }

    fn build_node(&self, node: &NormalizedGraphNode, ir: &Ir, resolved: &Resolved) -> Result<NodeSpec> {
        let mut component_meta: Option<&NormalizedComponent> = None;
        let mut component_callable: Option<Arc<dyn Component>> = None;

        if let Some(component_id) = &node.component_id {
            component_meta = ir.components.get(component_id);
            let Some(meta) = component_meta else {
                return Err(GraphError::Build(BuildError::new(
                    "ERR_NODE_TYPE",
                    format!("component '{component_id}' referenced by node '{}' is undefined", node.id),
                    node.pointer.clone(),
                )));
            };
            let Some(callable) = resolved.components.get(component_id) else {
                return Err(GraphError::Build(BuildError::new(
                    "ERR_COMPONENT_IMPORT",
                    format!("component '{component_id}' has not been materialized"),
                    node.pointer.clone(),
                )));
            };
            component_callable = Some(callable.clone());
            let _ = meta;
        }

        let kind = determine_kind(node, component_meta);
        if !SUPPORTED_KINDS.contains(&kind.as_str()) {
            return Err(GraphError::Build(BuildError::new(
                "ERR_NODE_TYPE",
                format!("node '{}' has unsupported kind '{kind}'", node.id),
                node.pointer.clone(),
            )));
        }

        if matches!(kind.as_str(), "llm" | "tool") {
            let Some(meta) = component_meta else {
                return Err(GraphError::Build(BuildError::new(
                    "ERR_NODE_TYPE",
                    format!("node '{}' of kind '{kind}' requires a component", node.id),
                    node.pointer.clone(),
                )));
            };
            check_provider(node, meta, resolved)?;
        }

        if kind == "tool" {
            if let Some(meta) = component_meta {
                check_tool(node, meta, resolved)?;
            }
        }

        if kind == "router" && node.routes.is_empty() {
            return Err(GraphError::Build(BuildError::new(
                "ERR_ROUTER_NO_MATCH",
                format!("router node '{}' does not define any routes", node.id),
                node.pointer.clone(),
            )));
        }

        if kind == "map" && component_meta.is_none() {
            return Err(GraphError::Build(BuildError::new(
                "ERR_MAP_BODY_NOT_FOUND",
                format!("map node '{}' requires a component", node.id),
                node.pointer.clone(),
            )));
        }

        let mut merged_config = node.config.clone();
        if matches!(kind.as_str(), "map" | "parallel") {
            if let Some(meta) = component_meta {
                for (key, value) in &meta.config {
                    merged_config.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        Ok(NodeSpec {
            id: node.id.clone(),
            kind,
            pointer: node.pointer.clone(),
            component_id: node.component_id.clone(),
            component: component_callable,
            component_meta: component_meta.cloned(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            routes: node.routes.clone(),
            next_nodes: node.next_nodes.clone(),
            config: merged_config,
        })
    }
}

fn check_provider(node: &NormalizedGraphNode, meta: &NormalizedComponent, resolved: &Resolved) -> Result<()> {
    let Some(provider_id) = &meta.provider_id else {
        return Err(GraphError::Build(BuildError::new(
            "ERR_PROVIDER_DEFAULT_MISSING",
            format!("node '{}' requires a provider but none was resolved", node.id),
            node.pointer.clone(),
        )));
    };
    if !resolved.providers.contains_key(provider_id) {
        return Err(GraphError::Build(BuildError::new(
            "ERR_PROVIDER_DEFAULT_MISSING",
            format!("provider '{provider_id}' for node '{}' is not available", node.id),
            node.pointer.clone(),
        )));
    }
    Ok(())
}

fn check_tool(node: &NormalizedGraphNode, meta: &NormalizedComponent, resolved: &Resolved) -> Result<()> {
    let Some(tool_id) = &meta.tool_id else {
        return Err(GraphError::Build(BuildError::new(
            "ERR_TOOL_NOT_FOUND",
            format!("node '{}' of kind 'tool' does not reference a tool", node.id),
            node.pointer.clone(),
        )));
    };
    if !resolved.tools.contains_key(tool_id) {
        return Err(GraphError::Build(BuildError::new(
            "ERR_TOOL_NOT_FOUND",
            format!("tool '{tool_id}' required by node '{}' is not available", node.id),
            node.pointer.clone(),
        )));
    }
    Ok(())
}

/// A declared kind wins when it names a recognized kind; otherwise falls
/// back to the bound component's kind; otherwise the declared string
/// passes through unchanged (and will fail the supported-kinds check).
fn determine_kind(node: &NormalizedGraphNode, component_meta: Option<&NormalizedComponent>) -> String {
    if let Some(declared) = &node.declared_kind {
        let lowered = declared.to_lowercase();
        if matches!(lowered.as_str(), "llm" | "tool" | "router" | "map" | "parallel") {
            return lowered;
        }
        if matches!(lowered.as_str(), "component" | "node" | "task") {
            if let Some(meta) = component_meta {
                let component_kind = meta.kind.to_lowercase();
                if matches!(component_kind.as_str(), "llm" | "tool" | "router" | "map" | "parallel") {
                    return component_kind;
                }
            }
        }
        return lowered;
    }
    component_meta.map(|m| m.kind.to_lowercase()).unwrap_or_else(|| "component".to_string())
}
