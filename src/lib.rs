//! # agent-graph — declarative DAG orchestration for LLM/tool workflows
//!
//! `agent-graph` compiles a YAML workflow document into an executable graph
//! and runs it with a cooperative async scheduler. A workflow is a DAG of
//! typed nodes — `llm`, `tool`, `router`, `map`, `parallel`, and plain
//! `component` — wired together by expressions that pull from graph inputs,
//! prior node outputs, or (inside a `map`) the current loop item.
//!
//! ## Pipeline
//!
//! 1. [`document`] parses and validates the YAML wire format into a
//!    [`Document`].
//! 2. [`ir`] lowers the document into cross-referenced, immutable
//!    [`Ir`](ir::Ir) — every id reference checked, every node reachable from
//!    the entry.
//! 3. [`registry`] materializes providers, tools, and components from the IR
//!    via pluggable factories.
//! 4. [`graph`] composes the IR and the materialized registry into a
//!    [`GraphDefinition`], inferring each node's kind and checking its
//!    preconditions.
//! 5. [`scheduler`] walks the compiled graph from its entrypoint, resolving
//!    inputs, invoking components under the policy plane, and routing to
//!    the next nodes.
//!
//! Cutting across all five: [`policy`] (retry, rate limiting, permissions,
//! cost, masking), [`events`] (a sequenced, permission- and cost-enforcing
//! event bus), [`context`] (cancellation and per-node invocation context),
//! and [`history`] (pluggable conversation-history backends).
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_graph::{DocumentLoader, normalize_document, Registry, GraphBuilder, Scheduler, RunOptions, RunDependencies};
//!
//! let document = DocumentLoader::new().load_str(yaml_source)?;
//! let normalization = normalize_document(&document)?;
//! let registry = Registry::new(); // factories registered by the host
//! let resolved = registry.materialize(&normalization.ir)?;
//! let definition = GraphBuilder::new().build(&normalization.ir, &resolved)?;
//! // Scheduler::new().run(&definition, inputs, deps, RunOptions::default()).await?;
//! ```

pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod graph;
pub mod history;
pub mod ir;
pub mod policy;
pub mod registry;
pub mod scheduler;

pub use context::{CancelToken, ComponentContext, LoopContext};
pub use document::{Document, DocumentLoader, ValidationIssue};
pub use error::{BuildError, DocumentError, GraphError, IrError, PolicyError, Result, RuntimeError};
pub use events::{EmitFn, EventBus, EventRecord, EventSink, JsonlEventSink, null_emit_fn};
pub use graph::{GraphBuilder, GraphDefinition, NodeSpec};
pub use history::{HistoryBackend, HistoryRegistry, InMemoryHistoryBackend, Message as HistoryMessage};
pub use ir::{Ir, NormalizationResult, NormalizationWarning, NormalizedComponent, NormalizedGraph, normalize_document};
pub use policy::{
    CostConfig, CostLimiter, FixedWindowRateLimiter, MaskingConfig, MaskingEngine, PermissionConfig,
    PermissionManager, RateLimiter, RateLimiterManager, RetryManager, RetryPolicy, RetryPolicyConfig, RetryStrategy,
    TokenBucketRateLimiter,
};
pub use registry::{Component, ComponentFactory, ProviderFactory, ProviderInstance, Registry, Resolved, StateView, ToolFactory, ToolInstance};
pub use scheduler::{GraphResult, NodeRuntimeState, RunDependencies, RunOptions, Scheduler};
