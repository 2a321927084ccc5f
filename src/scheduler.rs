//! Cooperative async graph scheduler: walks a [`GraphDefinition`] from its
//! entrypoint via a FIFO pending queue with an idempotent visited set,
//! resolving each node's inputs, invoking its bound component under the
//! policy plane (permissions, rate limits, retries), and routing to the
//! next nodes according to the node's kind.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::context::{CancelToken, ComponentContext, LoopContext};
use crate::error::{GraphError, Result};
use crate::events::EmitFn;
use crate::graph::{GraphDefinition, NodeSpec};
use crate::history::HistoryRegistry;
use crate::ir::NormalizedComponent;
use crate::policy::{PermissionManager, RateLimiterManager, RetryManager};
use crate::registry::{Component, StateView};

#[derive(Debug, Clone)]
pub struct NodeRuntimeState {
    pub outputs: HashMap<String, JsonValue>,
    pub result: JsonValue,
}

#[derive(Debug)]
pub struct GraphResult {
    pub outputs: HashMap<String, JsonValue>,
    pub node_states: HashMap<String, NodeRuntimeState>,
    pub run_id: String,
}

struct GraphState {
    inputs: HashMap<String, JsonValue>,
    node_states: HashMap<String, NodeRuntimeState>,
}

pub struct RunOptions {
    pub timeout: Option<std::time::Duration>,
    pub cancel_on_error: bool,
    pub run_id: Option<String>,
    pub deadline: Option<std::time::Instant>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { timeout: None, cancel_on_error: true, run_id: None, deadline: None }
    }
}

/// Collaborators a run needs but the scheduler itself does not own.
pub struct RunDependencies<'a> {
    pub emit: EmitFn,
    pub retry_manager: &'a RetryManager,
    pub rate_manager: &'a RateLimiterManager,
    pub permission_manager: &'a PermissionManager,
    pub histories: Arc<HistoryRegistry>,
    pub graph_name: Option<String>,
}

#[derive(Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(
        &self,
        definition: &GraphDefinition,
        inputs: HashMap<String, JsonValue>,
        mut deps: RunDependencies<'_>,
        options: RunOptions,
    ) -> Result<GraphResult> {
        let run_id = options.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if deps.graph_name.is_none() {
            deps.graph_name = definition.name.clone();
        }
        tracing::info!(run_id = %run_id, graph_name = ?deps.graph_name, entrypoint = %definition.entrypoint, "starting graph run");
        let cancel_token = CancelToken::new();
        let mut gstate = GraphState { inputs, node_states: HashMap::new() };
        let closables = collect_closables(definition);

        emit_event(
            &deps.emit,
            &run_id,
            "graph.start",
            vec![
                ("graph_name", graph_name_json(&deps)),
                ("entrypoint", json!(definition.entrypoint)),
            ],
        );

        let run_result = {
            let execution = self.execute(definition, &mut gstate, &run_id, &deps, &options, &cancel_token);
            match options.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel_token.cancel();
                        emit_event(
                            &deps.emit,
                            &run_id,
                            "timeout",
                            vec![("graph_name", graph_name_json(&deps)), ("timeout", json!(timeout.as_secs_f64()))],
                        );
                        emit_event(
                            &deps.emit,
                            &run_id,
                            "graph.finish",
                            vec![("graph_name", graph_name_json(&deps)), ("status", json!("timeout"))],
                        );
                        close_components(&closables, &deps.emit, &run_id).await;
                        return Err(GraphError::Timeout { duration_ms: (timeout.as_secs_f64() * 1000.0) as u64 });
                    }
                },
                None => execution.await,
            }
        };

        match run_result {
            Ok(outputs) => {
                emit_event(
                    &deps.emit,
                    &run_id,
                    "graph.finish",
                    vec![
                        ("graph_name", graph_name_json(&deps)),
                        ("status", json!("success")),
                        ("outputs", JsonValue::Object(outputs.clone().into_iter().collect())),
                    ],
                );
                close_components(&closables, &deps.emit, &run_id).await;
                tracing::info!(run_id = %run_id, "graph run finished successfully");
                Ok(GraphResult { outputs, node_states: gstate.node_states, run_id })
            }
            Err(err) => {
                cancel_token.cancel();
                emit_event(
                    &deps.emit,
                    &run_id,
                    "graph.finish",
                    vec![
                        ("graph_name", graph_name_json(&deps)),
                        ("status", json!("error")),
                        ("error_code", json!(err.code())),
                    ],
                );
                close_components(&closables, &deps.emit, &run_id).await;
                tracing::error!(run_id = %run_id, error_code = err.code(), "graph run failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        definition: &GraphDefinition,
        gstate: &mut GraphState,
        run_id: &str,
        deps: &RunDependencies<'_>,
        options: &RunOptions,
        cancel_token: &CancelToken,
    ) -> Result<HashMap<String, JsonValue>> {
        let mut pending: VecDeque<String> = VecDeque::new();
        pending.push_back(definition.entrypoint.clone());
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(node_id) = pending.pop_front() {
            if visited.contains(&node_id) {
                continue;
            }
            let spec = definition.nodes.get(&node_id).ok_or_else(|| {
                GraphError::runtime(
                    "ERR_EDGE_ENDPOINT_INVALID",
                    format!("node '{node_id}' referenced in graph is not defined"),
                    "/graph/nodes",
                )
            })?;
            let next_nodes = self.run_node(definition, spec, gstate, run_id, deps, options, cancel_token).await?;
            visited.insert(node_id.clone());
            for target in next_nodes {
                if !definition.nodes.contains_key(&target) {
                    return Err(GraphError::runtime(
                        "ERR_EDGE_ENDPOINT_INVALID",
                        format!("node '{node_id}' references undefined target '{target}'"),
                        spec.pointer.clone(),
                    ));
                }
                pending.push_back(target);
            }
        }

        collect_outputs(definition, gstate)
    }

    async fn run_node(
        &self,
        definition: &GraphDefinition,
        spec: &NodeSpec,
        gstate: &mut GraphState,
        run_id: &str,
        deps: &RunDependencies<'_>,
        options: &RunOptions,
        cancel_token: &CancelToken,
    ) -> Result<Vec<String>> {
        emit_event(
            &deps.emit,
            run_id,
            "node.start",
            vec![
                ("node_id", json!(spec.id)),
                ("kind", json!(spec.kind)),
                ("graph_name", graph_name_json(deps)),
            ],
        );
        let start = Instant::now();
        tracing::debug!(run_id, node_id = %spec.id, kind = %spec.kind, "executing node");

        let outcome: Result<(HashMap<String, JsonValue>, JsonValue)> = match spec.kind.as_str() {
            "map" => self.execute_map(spec, &*gstate, run_id, deps, cancel_token, options.deadline).await,
            "parallel" => self.execute_parallel(definition, spec, &*gstate, run_id, deps, cancel_token, options.deadline).await,
            _ => match invoke_component_spec(spec, &*gstate, run_id, deps, cancel_token, None, options.deadline).await {
                Ok((node_state, inputs_used)) => {
                    if matches!(spec.kind.as_str(), "llm" | "tool") {
                        emit_component_event(spec, &deps.emit, run_id, &inputs_used, &node_state);
                    }
                    Ok((node_state.outputs, node_state.result))
                }
                Err(err) => Err(err),
            },
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok((outputs, result)) => {
                gstate.node_states.insert(spec.id.clone(), NodeRuntimeState { outputs: outputs.clone(), result });
                emit_event(
                    &deps.emit,
                    run_id,
                    "node.finish",
                    vec![
                        ("node_id", json!(spec.id)),
                        ("kind", json!(spec.kind)),
                        ("status", json!("success")),
                        ("duration_ms", json!(duration_ms)),
                        ("outputs", JsonValue::Object(outputs.into_iter().collect())),
                        ("graph_name", graph_name_json(deps)),
                    ],
                );
                select_next(spec, gstate)
            }
            Err(err) => {
                tracing::warn!(run_id, node_id = %spec.id, kind = %spec.kind, error_code = err.code(), "node failed");
                emit_event(
                    &deps.emit,
                    run_id,
                    "error.raised",
                    vec![("node_id", json!(spec.id)), ("kind", json!(spec.kind)), ("message", json!(err.to_string()))],
                );
                emit_event(
                    &deps.emit,
                    run_id,
                    "node.finish",
                    vec![
                        ("node_id", json!(spec.id)),
                        ("kind", json!(spec.kind)),
                        ("status", json!("error")),
                        ("duration_ms", json!(duration_ms)),
                        ("outputs", json!({})),
                        ("graph_name", graph_name_json(deps)),
                    ],
                );
                if options.cancel_on_error {
                    cancel_token.cancel();
                    Err(err)
                } else {
                    gstate
                        .node_states
                        .insert(spec.id.clone(), NodeRuntimeState { outputs: HashMap::new(), result: JsonValue::Null });
                    Ok(Vec::new())
                }
            }
        }
    }

    async fn execute_map(
        &self,
        spec: &NodeSpec,
        gstate: &GraphState,
        run_id: &str,
        deps: &RunDependencies<'_>,
        cancel_token: &CancelToken,
        deadline: Option<std::time::Instant>,
    ) -> Result<(HashMap<String, JsonValue>, JsonValue)> {
        if spec.component.is_none() || spec.component_meta.is_none() {
            return Err(GraphError::runtime(
                "ERR_MAP_BODY_NOT_FOUND",
                format!("map node '{}' is missing a component", spec.id),
                spec.pointer.clone(),
            ));
        }

        let items_value = resolve_expression(spec.config.get("collection"), gstate, None);
        let JsonValue::Array(items) = items_value else {
            return Err(GraphError::runtime(
                "ERR_MAP_OVER_NOT_ARRAY",
                format!("map node '{}' requires array-like input", spec.id),
                spec.pointer.clone(),
            ));
        };

        let failure_mode =
            spec.config.get("failure_mode").and_then(JsonValue::as_str).unwrap_or("fail_fast").to_lowercase();
        let ordered = spec.config.get("ordered").and_then(JsonValue::as_bool).unwrap_or(true);
        let result_key = spec.config.get("result_key").and_then(JsonValue::as_str).unwrap_or("results").to_string();

        let mut results: Vec<(usize, HashMap<String, JsonValue>)> = Vec::new();
        let mut errors: Vec<JsonValue> = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let loop_ctx = LoopContext { item, index };
            match invoke_component_spec(spec, gstate, run_id, deps, cancel_token, Some(loop_ctx), deadline).await {
                Ok((node_state, _inputs_used)) => results.push((index, node_state.outputs)),
                Err(err) => {
                    emit_event(
                        &deps.emit,
                        run_id,
                        "error.raised",
                        vec![
                            ("node_id", json!(spec.id)),
                            ("kind", json!(spec.kind)),
                            ("iteration", json!(index)),
                            ("message", json!(err.to_string())),
                        ],
                    );
                    match failure_mode.as_str() {
                        "fail_fast" => {
                            return Err(GraphError::runtime(
                                "ERR_NODE_RUNTIME",
                                format!("map iteration {index} failed: {err}"),
                                spec.pointer.clone(),
                            ))
                        }
                        "collect_errors" => errors.push(json!({"index": index, "error": err.to_string()})),
                        "skip_failed" => {}
                        _ => return Err(err),
                    }
                }
            }
        }

        if ordered {
            results.sort_by_key(|(index, _)| *index);
        }

        let mapped: Vec<JsonValue> =
            results.into_iter().map(|(_, outputs)| JsonValue::Object(outputs.into_iter().collect())).collect();
        let mut outputs = HashMap::new();
        outputs.insert(result_key, JsonValue::Array(mapped.clone()));
        outputs.insert("errors".to_string(), JsonValue::Array(errors));
        Ok((outputs, JsonValue::Array(mapped)))
    }

    async fn execute_parallel(
        &self,
        definition: &GraphDefinition,
        spec: &NodeSpec,
        gstate: &GraphState,
        run_id: &str,
        deps: &RunDependencies<'_>,
        cancel_token: &CancelToken,
        deadline: Option<std::time::Instant>,
    ) -> Result<(HashMap<String, JsonValue>, JsonValue)> {
        let branches = spec
            .config
            .get("branches")
            .and_then(JsonValue::as_array)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                GraphError::runtime(
                    "ERR_PARALLEL_EMPTY",
                    format!("parallel node '{}' defines no branches", spec.id),
                    spec.pointer.clone(),
                )
            })?;

        let merge_policy = spec.config.get("merge_policy").and_then(JsonValue::as_str).unwrap_or("overwrite").to_lowercase();
        let mode = spec.config.get("mode").and_then(JsonValue::as_str).unwrap_or("all").to_lowercase();

        let mut branch_specs: Vec<(String, &NodeSpec)> = Vec::new();
        for branch in branches {
            let Some(branch_id) = branch.as_str() else { continue };
            let branch_spec = definition.nodes.get(branch_id).ok_or_else(|| {
                GraphError::runtime(
                    "ERR_EDGE_ENDPOINT_INVALID",
                    format!("parallel branch '{branch_id}' is not defined"),
                    spec.pointer.clone(),
                )
            })?;
            branch_specs.push((branch_id.to_string(), branch_spec));
        }
        if branch_specs.is_empty() {
            return Err(GraphError::runtime(
                "ERR_PARALLEL_EMPTY",
                format!("parallel node '{}' defines no valid branches", spec.id),
                spec.pointer.clone(),
            ));
        }

        let mut results: HashMap<String, NodeRuntimeState> = HashMap::new();

        if matches!(mode.as_str(), "first_success" | "any") {
            let futures: Vec<_> = branch_specs
                .iter()
                .map(|(id, bspec)| {
                    let id = id.clone();
                    Box::pin(async move {
                        let outcome = invoke_component_spec(bspec, gstate, run_id, deps, cancel_token, None, deadline).await;
                        (id, outcome)
                    })
                })
                .collect();
            let ((winning_id, outcome), _index, _rest) = futures::future::select_all(futures).await;
            let (node_state, _inputs_used) = outcome.map_err(|err| {
                GraphError::runtime(
                    "ERR_NODE_RUNTIME",
                    format!("parallel node '{}' failed: {err}", spec.id),
                    spec.pointer.clone(),
                )
            })?;
            results.insert(winning_id, node_state);
        } else {
            let futures: Vec<_> = branch_specs
                .iter()
                .map(|(id, bspec)| {
                    let id = id.clone();
                    async move {
                        let outcome = invoke_component_spec(bspec, gstate, run_id, deps, cancel_token, None, deadline).await;
                        (id, outcome)
                    }
                })
                .collect();
            for (id, outcome) in futures::future::join_all(futures).await {
                let (node_state, _inputs_used) = outcome?;
                results.insert(id, node_state);
            }
        }

        let mut merged_outputs: HashMap<String, JsonValue> = HashMap::new();
        if merge_policy == "namespace" {
            for (branch_id, state) in &results {
                merged_outputs.insert(branch_id.clone(), JsonValue::Object(state.outputs.clone().into_iter().collect()));
            }
        } else {
            for state in results.values() {
                for (key, value) in &state.outputs {
                    if merge_policy == "error" {
                        if let Some(existing) = merged_outputs.get(key) {
                            if existing != value {
                                return Err(GraphError::runtime(
                                    "ERR_NODE_RUNTIME",
                                    format!("parallel merge conflict for key '{key}'"),
                                    spec.pointer.clone(),
                                ));
                            }
                        }
                    }
                    merged_outputs.insert(key.clone(), value.clone());
                }
            }
        }

        let branch_outputs: HashMap<String, JsonValue> = results
            .iter()
            .map(|(id, state)| (id.clone(), JsonValue::Object(state.outputs.clone().into_iter().collect())))
            .collect();
        let mut outputs = HashMap::new();
        outputs.insert("results".to_string(), JsonValue::Object(merged_outputs.into_iter().collect()));
        Ok((outputs, JsonValue::Object(branch_outputs.into_iter().collect())))
    }
}

async fn invoke_component_spec(
    spec: &NodeSpec,
    gstate: &GraphState,
    run_id: &str,
    deps: &RunDependencies<'_>,
    cancel_token: &CancelToken,
    loop_ctx: Option<LoopContext>,
    deadline: Option<std::time::Instant>,
) -> Result<(NodeRuntimeState, HashMap<String, JsonValue>)> {
    let Some(component) = spec.component.as_ref() else {
        return Ok((NodeRuntimeState { outputs: HashMap::new(), result: JsonValue::Null }, HashMap::new()));
    };

    if spec.kind == "tool" {
        if let Some(meta) = &spec.component_meta {
            let required = required_permissions(meta, component.as_ref());
            deps.permission_manager.check(&meta.id, &required)?;
        }
    }

    let policy = deps.retry_manager.for_node(&spec.id)?;
    let recorded_inputs: RefCell<HashMap<String, JsonValue>> = RefCell::new(HashMap::new());

    let attempt = || async {
        deps.rate_manager
            .acquire(
                &deps.emit,
                run_id,
                &spec.id,
                spec.component_meta.as_ref().and_then(|m| m.provider_id.as_deref()),
            )
            .await?;

        let inputs_payload = prepare_inputs(spec, gstate, loop_ctx.as_ref());
        *recorded_inputs.borrow_mut() = inputs_payload.clone();

        let state_view = make_state_view(gstate);
        let mut ctx = build_context(spec, run_id, deps, cancel_token, loop_ctx.clone(), deadline);

        let inputs_payload = match component.before_execute(&inputs_payload, &ctx).await? {
            Some(modified) => modified,
            None => inputs_payload,
        };

        let result = component.call(&state_view, &inputs_payload, &mut ctx).await?;

        let result = match component.after_execute(&result, &inputs_payload, &ctx).await? {
            Some(modified) => modified,
            None => result,
        };

        let outputs = prepare_outputs(spec, &result);
        Ok(NodeRuntimeState { outputs, result })
    };

    let outcome = policy.execute(&deps.emit, run_id, &spec.id, attempt).await;

    match outcome {
        Ok(node_state) => Ok((node_state, recorded_inputs.into_inner())),
        Err(err) => {
            let ctx = build_context(spec, run_id, deps, cancel_token, loop_ctx.clone(), deadline);
            let inputs_used = recorded_inputs.into_inner();
            component.on_error(&err, &inputs_used, &ctx).await;
            Err(err)
        }
    }
}

fn build_context(
    spec: &NodeSpec,
    run_id: &str,
    deps: &RunDependencies<'_>,
    cancel_token: &CancelToken,
    loop_ctx: Option<LoopContext>,
    deadline: Option<std::time::Instant>,
) -> ComponentContext {
    ComponentContext {
        node_id: spec.id.clone(),
        graph_name: deps.graph_name.clone(),
        config: spec.config.clone(),
        emit: deps.emit.clone(),
        cancel_token: cancel_token.clone(),
        deadline,
        run_id: run_id.to_string(),
        loop_ctx,
        histories: deps.histories.clone(),
    }
}

fn required_permissions(meta: &NormalizedComponent, component: &dyn Component) -> Vec<String> {
    if let Some(JsonValue::Array(items)) = meta.config.get("requires_permissions") {
        return items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    }
    component.requires_permissions()
}

fn prepare_inputs(spec: &NodeSpec, gstate: &GraphState, loop_ctx: Option<&LoopContext>) -> HashMap<String, JsonValue> {
    let Some(meta) = &spec.component_meta else { return HashMap::new() };
    meta.inputs.iter().map(|(name, expr)| (name.clone(), resolve_expression(Some(expr), gstate, loop_ctx))).collect()
}

fn prepare_outputs(spec: &NodeSpec, result: &JsonValue) -> HashMap<String, JsonValue> {
    let Some(meta) = &spec.component_meta else { return HashMap::new() };
    meta.outputs.iter().map(|(name, expr)| (name.clone(), resolve_result_expression(Some(expr), result))).collect()
}

fn make_state_view(gstate: &GraphState) -> StateView {
    StateView {
        graph_inputs: gstate.inputs.clone(),
        node_outputs: gstate.node_states.iter().map(|(id, ns)| (id.clone(), ns.outputs.clone())).collect(),
    }
}

fn select_next(spec: &NodeSpec, gstate: &GraphState) -> Result<Vec<String>> {
    if spec.kind == "router" {
        let node_state = gstate.node_states.get(&spec.id).ok_or_else(|| {
            GraphError::runtime(
                "ERR_ROUTER_NO_MATCH",
                format!("router node '{}' did not produce a state", spec.id),
                spec.pointer.clone(),
            )
        })?;
        let route_value = node_state.outputs.get("route").ok_or_else(|| {
            GraphError::runtime(
                "ERR_ROUTER_NO_MATCH",
                format!("router node '{}' did not produce a route output", spec.id),
                spec.pointer.clone(),
            )
        })?;
        let route_key = stringify(route_value);
        if let Some(target) = spec.routes.get(&route_key) {
            return Ok(vec![target.clone()]);
        }
        if let Some(default_target) = spec.routes.get("default") {
            return Ok(vec![default_target.clone()]);
        }
        return Err(GraphError::runtime(
            "ERR_ROUTER_NO_MATCH",
            format!("router node '{}' produced unknown route '{route_key}'", spec.id),
            spec.pointer.clone(),
        ));
    }
    Ok(spec.next_nodes.clone())
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn collect_outputs(definition: &GraphDefinition, gstate: &GraphState) -> Result<HashMap<String, JsonValue>> {
    let mut outputs = HashMap::new();
    for mapping in &definition.outputs {
        let node_state = gstate.node_states.get(&mapping.node_id).ok_or_else(|| {
            GraphError::runtime(
                "ERR_EDGE_ENDPOINT_INVALID",
                format!("graph output references undefined node '{}'", mapping.node_id),
                "/graph/outputs",
            )
        })?;
        let Some(value) = node_state.outputs.get(&mapping.output) else {
            return Err(GraphError::runtime(
                "ERR_NODE_TYPE",
                format!("graph output '{}' expects field '{}' from node '{}'", mapping.key, mapping.output, mapping.node_id),
                "/graph/outputs",
            ));
        };
        outputs.insert(mapping.key.clone(), value.clone());
    }
    Ok(outputs)
}

fn emit_component_event(
    spec: &NodeSpec,
    emit: &EmitFn,
    run_id: &str,
    inputs: &HashMap<String, JsonValue>,
    node_state: &NodeRuntimeState,
) {
    match spec.kind.as_str() {
        "llm" => {
            let provider_id = spec.component_meta.as_ref().and_then(|m| m.provider_id.clone());
            let usage = node_state.result.get("usage");
            let tokens_in = usage.and_then(|u| u.get("prompt_tokens")).cloned().unwrap_or(JsonValue::Null);
            let tokens_out = usage.and_then(|u| u.get("completion_tokens")).cloned().unwrap_or(JsonValue::Null);
            let model = spec.component_meta.as_ref().and_then(|m| m.config.get("model")).cloned().unwrap_or(JsonValue::Null);
            let component_id = spec.component_meta.as_ref().map(|m| json!(m.id)).unwrap_or(JsonValue::Null);
            emit_event(
                emit,
                run_id,
                "llm.call",
                vec![
                    ("node_id", json!(spec.id)),
                    ("provider_id", provider_id.map(JsonValue::String).unwrap_or(JsonValue::Null)),
                    ("model", model),
                    ("component_id", component_id),
                    ("inputs", JsonValue::Object(inputs.clone().into_iter().collect())),
                    ("outputs", JsonValue::Object(node_state.outputs.clone().into_iter().collect())),
                    ("tokens_in", tokens_in),
                    ("tokens_out", tokens_out),
                ],
            );
        }
        "tool" => {
            let tool_id = spec.component_meta.as_ref().and_then(|m| m.tool_id.clone());
            let component_id = spec.component_meta.as_ref().map(|m| json!(m.id)).unwrap_or(JsonValue::Null);
            let required: Vec<JsonValue> = spec
                .component_meta
                .as_ref()
                .and_then(|m| m.config.get("requires_permissions"))
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            emit_event(
                emit,
                run_id,
                "tool.call",
                vec![
                    ("node_id", json!(spec.id)),
                    ("tool_id", tool_id.map(JsonValue::String).unwrap_or(JsonValue::Null)),
                    ("component_id", component_id),
                    ("inputs", JsonValue::Object(inputs.clone().into_iter().collect())),
                    ("outputs", JsonValue::Object(node_state.outputs.clone().into_iter().collect())),
                    ("required_permissions", JsonValue::Array(required)),
                ],
            );
        }
        _ => {}
    }
}

fn collect_closables(definition: &GraphDefinition) -> Vec<(Arc<dyn Component>, Option<String>)> {
    let mut seen: HashMap<usize, (Arc<dyn Component>, Option<String>)> = HashMap::new();
    for spec in definition.nodes.values() {
        let Some(component) = &spec.component else { continue };
        let ptr = Arc::as_ptr(component) as *const () as usize;
        let component_id = spec.component_meta.as_ref().map(|m| m.id.clone());
        seen.entry(ptr).or_insert_with(|| (component.clone(), component_id));
    }
    seen.into_values().collect()
}

async fn close_components(closables: &[(Arc<dyn Component>, Option<String>)], emit: &EmitFn, run_id: &str) {
    for (component, component_id) in closables {
        if let Err(err) = component.close().await {
            emit_event(
                emit,
                run_id,
                "error.raised",
                vec![
                    ("node_id", component_id.clone().map(JsonValue::String).unwrap_or(JsonValue::Null)),
                    ("kind", json!("component")),
                    ("message", json!(format!("close failed: {err}"))),
                ],
            );
        }
    }
}

fn emit_event(emit: &EmitFn, run_id: &str, event: &str, pairs: Vec<(&str, JsonValue)>) {
    let mut payload: HashMap<String, JsonValue> = pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    payload.entry("run_id".to_string()).or_insert_with(|| json!(run_id));
    let _ = emit(event, payload);
}

fn graph_name_json(deps: &RunDependencies<'_>) -> JsonValue {
    deps.graph_name.clone().map(JsonValue::String).unwrap_or(JsonValue::Null)
}

/// `graph.inputs.<key>`, `node.<id>.<field>`, `map.item[.<path>]`,
/// `map.index`, `const:<literal>`, else the expression passes through.
fn resolve_expression(expression: Option<&JsonValue>, gstate: &GraphState, loop_ctx: Option<&LoopContext>) -> JsonValue {
    let Some(expr) = expression else { return JsonValue::Null };
    let Some(s) = expr.as_str() else { return expr.clone() };

    if let Some(key) = s.strip_prefix("graph.inputs.") {
        return gstate.inputs.get(key).cloned().unwrap_or(JsonValue::Null);
    }
    if s.starts_with("node.") {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() < 3 {
            return JsonValue::Null;
        }
        let node_id = parts[1];
        let field = parts[2];
        return gstate.node_states.get(node_id).and_then(|ns| ns.outputs.get(field)).cloned().unwrap_or(JsonValue::Null);
    }
    if s == "map.item" {
        return loop_ctx.map(|l| l.item.clone()).unwrap_or(JsonValue::Null);
    }
    if let Some(path) = s.strip_prefix("map.item.") {
        let Some(loop_ctx) = loop_ctx else { return JsonValue::Null };
        return traverse_dotted_path(&loop_ctx.item, path);
    }
    if s == "map.index" {
        return loop_ctx.map(|l| JsonValue::from(l.index)).unwrap_or(JsonValue::Null);
    }
    if let Some(literal) = s.strip_prefix("const:") {
        return JsonValue::String(literal.to_string());
    }
    expr.clone()
}

fn traverse_dotted_path(value: &JsonValue, path: &str) -> JsonValue {
    let mut current = value;
    for segment in path.split('.') {
        match current.as_object().and_then(|o| o.get(segment)) {
            Some(next) => current = next,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}

enum PathToken {
    Key(String),
    Index(usize),
}

/// `$.a.b[0].c`-style subset: dotted keys plus bracketed array indices.
fn tokenize_jsonpath(path: &str) -> Vec<PathToken> {
    let mut tokens = Vec::new();
    let mut chars = path.chars().peekable();
    let mut buf = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                if !buf.is_empty() {
                    tokens.push(PathToken::Key(std::mem::take(&mut buf)));
                }
            }
            '[' => {
                if !buf.is_empty() {
                    tokens.push(PathToken::Key(std::mem::take(&mut buf)));
                }
                chars.next();
                let mut idx_buf = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    idx_buf.push(d);
                }
                if let Ok(idx) = idx_buf.parse::<usize>() {
                    tokens.push(PathToken::Index(idx));
                }
            }
            _ => {
                buf.push(c);
                chars.next();
            }
        }
    }
    if !buf.is_empty() {
        tokens.push(PathToken::Key(buf));
    }
    tokens
}

fn resolve_result_expression(expression: Option<&JsonValue>, result: &JsonValue) -> JsonValue {
    let Some(expr) = expression else { return JsonValue::Null };
    let Some(s) = expr.as_str() else { return expr.clone() };
    let Some(path) = s.strip_prefix("$.") else { return expr.clone() };

    let mut current = result.clone();
    for token in tokenize_jsonpath(path) {
        current = match token {
            PathToken::Key(key) => match current.as_object().and_then(|o| o.get(&key)) {
                Some(v) => v.clone(),
                None => return JsonValue::Null,
            },
            PathToken::Index(idx) => match current.as_array().and_then(|a| a.get(idx)) {
                Some(v) => v.clone(),
                None => return JsonValue::Null,
            },
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::null_emit_fn;
    use crate::graph::{GraphBuilder, NodeSpec as GraphNodeSpec};
    use crate::ir::{NormalizedGraph, NormalizedGraphNode, NormalizedGraphOutput, NormalizedRuntime};
    use crate::policy::{PermissionConfig, RateLimiterManager as RateManager, RetryPolicyConfig, RetryStrategy};
    use crate::registry::{ProviderInstance, ToolInstance};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Component for Echo {
        async fn call(
            &self,
            _state: &StateView,
            inputs: &HashMap<String, JsonValue>,
            _ctx: &mut ComponentContext,
        ) -> Result<JsonValue> {
            Ok(JsonValue::Object(inputs.clone().into_iter().collect()))
        }
    }

    struct Router(&'static str);

    #[async_trait]
    impl Component for Router {
        async fn call(
            &self,
            _state: &StateView,
            _inputs: &HashMap<String, JsonValue>,
            _ctx: &mut ComponentContext,
        ) -> Result<JsonValue> {
            Ok(json!({"route": self.0}))
        }
    }

    struct Failing;

    #[async_trait]
    impl Component for Failing {
        async fn call(
            &self,
            _state: &StateView,
            _inputs: &HashMap<String, JsonValue>,
            _ctx: &mut ComponentContext,
        ) -> Result<JsonValue> {
            Err(GraphError::runtime("ERR_UPSTREAM", "boom", ""))
        }
    }

    fn node(id: &str, component_id: &str, next: Vec<&str>, pointer: &str) -> NormalizedGraphNode {
        NormalizedGraphNode {
            id: id.to_string(),
            declared_kind: Some("component".to_string()),
            component_id: Some(component_id.to_string()),
            next_nodes: next.into_iter().map(str::to_string).collect(),
            routes: HashMap::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            config: HashMap::new(),
            pointer: pointer.to_string(),
        }
    }

    fn component_meta(
        id: &str,
        kind: &str,
        inputs: HashMap<String, JsonValue>,
        outputs: HashMap<String, JsonValue>,
    ) -> NormalizedComponent {
        NormalizedComponent {
            id: id.to_string(),
            kind: kind.to_string(),
            provider_id: None,
            tool_id: None,
            inputs,
            outputs,
            config: HashMap::new(),
        }
    }

    fn default_retry_manager() -> RetryManager {
        RetryManager::new(
            RetryPolicyConfig { strategy: RetryStrategy::Fixed, max_attempts: 1, interval: Duration::from_millis(1), jitter: Duration::ZERO },
            HashMap::new(),
        )
        .unwrap()
    }

    fn retrying_manager() -> RetryManager {
        RetryManager::new(
            RetryPolicyConfig { strategy: RetryStrategy::Fixed, max_attempts: 3, interval: Duration::from_millis(1), jitter: Duration::ZERO },
            HashMap::new(),
        )
        .unwrap()
    }

    fn deps<'a>(retry_manager: &'a RetryManager, rate_manager: &'a RateManager, permission_manager: &'a PermissionManager) -> RunDependencies<'a> {
        RunDependencies {
            emit: null_emit_fn(),
            retry_manager,
            rate_manager,
            permission_manager,
            histories: Arc::new(HashMap::new()),
            graph_name: Some("test".to_string()),
        }
    }

    #[tokio::test]
    async fn linear_graph_passes_graph_input_through_to_output() {
        let mut inputs = HashMap::new();
        inputs.insert("text".to_string(), json!("graph.inputs.text"));

        let mut outputs_decl = HashMap::new();
        outputs_decl.insert("text".to_string(), json!("$.text"));

        let mut ir_components = HashMap::new();
        ir_components.insert("echo".to_string(), component_meta("echo", "component", inputs, outputs_decl));

        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), node("start", "echo", vec![], "/graph/nodes/start"));

        let ir = crate::ir::Ir {
            version: None,
            runtime: NormalizedRuntime { engine: "lc.lcel".to_string(), default_provider: None },
            providers: HashMap::new(),
            tools: HashMap::new(),
            components: ir_components,
            graph: NormalizedGraph {
                entry_id: "start".to_string(),
                nodes,
                outputs: vec![NormalizedGraphOutput { key: "text".to_string(), node_id: "start".to_string(), output: "text".to_string() }],
            },
            policies: HashMap::new(),
            histories: HashMap::new(),
        };

        let mut registry = crate::registry::Registry::new();
        registry.register_component_factory(
            "component",
            Arc::new(
                |_c: &NormalizedComponent, _p: Option<&ProviderInstance>, _t: Option<&ToolInstance>| {
                    Ok(Arc::new(Echo) as Arc<dyn Component>)
                },
            ),
        );
        let resolved = registry.materialize(&ir).unwrap();
        let definition = GraphBuilder::new().build(&ir, &resolved).unwrap();

        let retry_manager = default_retry_manager();
        let rate_manager = RateManager::new();
        let permission_manager = PermissionManager::new(PermissionConfig::default());
        let run_deps = deps(&retry_manager, &rate_manager, &permission_manager);

        let mut graph_inputs = HashMap::new();
        graph_inputs.insert("text".to_string(), json!("hello"));

        let result = Scheduler::new().run(&definition, graph_inputs, run_deps, RunOptions::default()).await.unwrap();
        assert_eq!(result.outputs["text"], json!("hello"));
        let _: &GraphNodeSpec = definition.nodes.get("start").unwrap();
    }

    #[tokio::test]
    async fn router_falls_back_to_default_route() {
        let mut router_outputs = HashMap::new();
        router_outputs.insert("route".to_string(), json!("$.route"));

        let mut ir_components = HashMap::new();
        ir_components.insert("router".to_string(), component_meta("router", "component", HashMap::new(), router_outputs));
        ir_components.insert("echo".to_string(), component_meta("echo", "component", HashMap::new(), HashMap::new()));

        let mut start_node = node("start", "router", vec![], "/graph/nodes/start");
        start_node.declared_kind = Some("router".to_string());
        start_node.routes.insert("default".to_string(), "fallback".to_string());

        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), start_node);
        nodes.insert("fallback".to_string(), node("fallback", "echo", vec![], "/graph/nodes/fallback"));

        let ir = crate::ir::Ir {
            version: None,
            runtime: NormalizedRuntime { engine: "lc.lcel".to_string(), default_provider: None },
            providers: HashMap::new(),
            tools: HashMap::new(),
            components: ir_components,
            graph: NormalizedGraph { entry_id: "start".to_string(), nodes, outputs: Vec::new() },
            policies: HashMap::new(),
            histories: HashMap::new(),
        };

        let mut registry = crate::registry::Registry::new();
        registry.register_component_factory(
            "component",
            Arc::new(
                |c: &NormalizedComponent, _p: Option<&ProviderInstance>, _t: Option<&ToolInstance>| {
                    if c.id == "router" {
                        Ok(Arc::new(Router("unmatched")) as Arc<dyn Component>)
                    } else {
                        Ok(Arc::new(Echo) as Arc<dyn Component>)
                    }
                },
            ),
        );
        let resolved = registry.materialize(&ir).unwrap();
        let definition = GraphBuilder::new().build(&ir, &resolved).unwrap();

        let retry_manager = default_retry_manager();
        let rate_manager = RateManager::new();
        let permission_manager = PermissionManager::new(PermissionConfig::default());
        let run_deps = deps(&retry_manager, &rate_manager, &permission_manager);

        let result = Scheduler::new().run(&definition, HashMap::new(), run_deps, RunOptions::default()).await.unwrap();
        assert!(result.node_states.contains_key("fallback"));
    }

    #[tokio::test]
    async fn retries_transient_component_failure_then_succeeds() {
        struct FlakyOnce {
            calls: std::sync::atomic::AtomicU32,
        }

        #[async_trait]
        impl Component for FlakyOnce {
            async fn call(
                &self,
                _state: &StateView,
                _inputs: &HashMap<String, JsonValue>,
                _ctx: &mut ComponentContext,
            ) -> Result<JsonValue> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Err(GraphError::runtime("ERR_UPSTREAM", "temporarily unavailable", ""))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        }

        let mut ir_components = HashMap::new();
        ir_components.insert("flaky".to_string(), component_meta("flaky", "component", HashMap::new(), HashMap::new()));

        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), node("start", "flaky", vec![], "/graph/nodes/start"));

        let ir = crate::ir::Ir {
            version: None,
            runtime: NormalizedRuntime { engine: "lc.lcel".to_string(), default_provider: None },
            providers: HashMap::new(),
            tools: HashMap::new(),
            components: ir_components,
            graph: NormalizedGraph { entry_id: "start".to_string(), nodes, outputs: Vec::new() },
            policies: HashMap::new(),
            histories: HashMap::new(),
        };

        let mut registry = crate::registry::Registry::new();
        registry.register_component_factory(
            "component",
            Arc::new(
                |_c: &NormalizedComponent, _p: Option<&ProviderInstance>, _t: Option<&ToolInstance>| {
                    Ok(Arc::new(FlakyOnce { calls: std::sync::atomic::AtomicU32::new(0) }) as Arc<dyn Component>)
                },
            ),
        );
        let resolved = registry.materialize(&ir).unwrap();
        let definition = GraphBuilder::new().build(&ir, &resolved).unwrap();

        let retry_manager = retrying_manager();
        let rate_manager = RateManager::new();
        let permission_manager = PermissionManager::new(PermissionConfig::default());
        let run_deps = deps(&retry_manager, &rate_manager, &permission_manager);

        let result = Scheduler::new().run(&definition, HashMap::new(), run_deps, RunOptions::default()).await.unwrap();
        assert_eq!(result.node_states["start"].result, json!({"ok": true}));
    }

    #[test]
    fn jsonpath_subset_tokenizer_resolves_nested_index() {
        let result = json!({"choices": [{"text": "hi"}]});
        let resolved = resolve_result_expression(Some(&json!("$.choices[0].text")), &result);
        assert_eq!(resolved, json!("hi"));
    }

    #[test]
    fn jsonpath_subset_tokenizer_returns_null_on_miss() {
        let result = json!({"choices": []});
        let resolved = resolve_result_expression(Some(&json!("$.choices[0].text")), &result);
        assert_eq!(resolved, JsonValue::Null);
    }

    #[tokio::test]
    async fn failing_node_with_fail_fast_cancels_run() {
        let mut ir_components = HashMap::new();
        ir_components.insert("failing".to_string(), component_meta("failing", "component", HashMap::new(), HashMap::new()));

        let mut nodes = HashMap::new();
        nodes.insert("start".to_string(), node("start", "failing", vec![], "/graph/nodes/start"));

        let ir = crate::ir::Ir {
            version: None,
            runtime: NormalizedRuntime { engine: "lc.lcel".to_string(), default_provider: None },
            providers: HashMap::new(),
            tools: HashMap::new(),
            components: ir_components,
            graph: NormalizedGraph { entry_id: "start".to_string(), nodes, outputs: Vec::new() },
            policies: HashMap::new(),
            histories: HashMap::new(),
        };

        let mut registry = crate::registry::Registry::new();
        registry.register_component_factory(
            "component",
            Arc::new(
                |_c: &NormalizedComponent, _p: Option<&ProviderInstance>, _t: Option<&ToolInstance>| {
                    Ok(Arc::new(Failing) as Arc<dyn Component>)
                },
            ),
        );
        let resolved = registry.materialize(&ir).unwrap();
        let definition = GraphBuilder::new().build(&ir, &resolved).unwrap();

        let retry_manager = default_retry_manager();
        let rate_manager = RateManager::new();
        let permission_manager = PermissionManager::new(PermissionConfig::default());
        let run_deps = deps(&retry_manager, &rate_manager, &permission_manager);

        let err = Scheduler::new().run(&definition, HashMap::new(), run_deps, RunOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "ERR_UPSTREAM");
    }
}
