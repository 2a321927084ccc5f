//! Registry & resolver.
//!
//! Materializes provider, tool, and component runtime objects from IR
//! descriptors via pluggable factories, caching each by id, and validating
//! that every reference resolves. Provider/tool/component *factories*
//! themselves are external collaborators; this module owns only the
//! dispatch table and the resolution order.
//!
//! Factories are held as a statically-registered table of
//! `type -> Arc<dyn Factory>` values, keyed by kind string and looked up
//! at materialization time rather than dynamically loaded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::context::ComponentContext;
use crate::error::{GraphError, IrError, Result};
use crate::ir::{NormalizedComponent, NormalizedProvider, NormalizedTool};

/// A materialized provider is just a key/value mapping produced by its
/// factory.
pub type ProviderInstance = HashMap<String, JsonValue>;

#[derive(Debug, Clone, Default)]
pub struct ToolInstance {
    pub permissions: Vec<String>,
    pub config: HashMap<String, JsonValue>,
}

/// View of run state exposed to a component: the caller's inputs and the
/// outputs of every previously completed node.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    pub graph_inputs: HashMap<String, JsonValue>,
    pub node_outputs: HashMap<String, HashMap<String, JsonValue>>,
}

/// The unit that knows how to transform inputs into a result. All lifecycle
/// hooks are optional — the duck-typed `hasattr` detection in the source
/// becomes an explicit capability test via default no-op trait methods.
#[async_trait]
pub trait Component: Send + Sync {
    async fn call(
        &self,
        state: &StateView,
        inputs: &HashMap<String, JsonValue>,
        ctx: &mut ComponentContext,
    ) -> Result<JsonValue>;

    async fn before_execute(
        &self,
        _inputs: &HashMap<String, JsonValue>,
        _ctx: &ComponentContext,
    ) -> Result<Option<HashMap<String, JsonValue>>> {
        Ok(None)
    }

    async fn after_execute(
        &self,
        _result: &JsonValue,
        _inputs: &HashMap<String, JsonValue>,
        _ctx: &ComponentContext,
    ) -> Result<Option<JsonValue>> {
        Ok(None)
    }

    async fn on_error(
        &self,
        _error: &GraphError,
        _inputs: &HashMap<String, JsonValue>,
        _ctx: &ComponentContext,
    ) {
    }

    /// Components that hold a resource (connection, file handle) override
    /// this; it is invoked at most once per graph teardown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Permissions this component requires when bound to a `tool` node.
    /// Empty by default.
    fn requires_permissions(&self) -> Vec<String> {
        Vec::new()
    }
}

pub trait ProviderFactory: Send + Sync {
    fn build(&self, provider: &NormalizedProvider) -> Result<ProviderInstance>;
}

pub trait ToolFactory: Send + Sync {
    fn build(&self, tool: &NormalizedTool, provider: Option<&ProviderInstance>) -> Result<ToolInstance>;
}

pub trait ComponentFactory: Send + Sync {
    fn build(
        &self,
        component: &NormalizedComponent,
        provider: Option<&ProviderInstance>,
        tool: Option<&ToolInstance>,
    ) -> Result<Arc<dyn Component>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&NormalizedProvider) -> Result<ProviderInstance> + Send + Sync,
{
    fn build(&self, provider: &NormalizedProvider) -> Result<ProviderInstance> {
        self(provider)
    }
}

impl<F> ToolFactory for F
where
    F: Fn(&NormalizedTool, Option<&ProviderInstance>) -> Result<ToolInstance> + Send + Sync,
{
    fn build(&self, tool: &NormalizedTool, provider: Option<&ProviderInstance>) -> Result<ToolInstance> {
        self(tool, provider)
    }
}

impl<F> ComponentFactory for F
where
    F: Fn(&NormalizedComponent, Option<&ProviderInstance>, Option<&ToolInstance>) -> Result<Arc<dyn Component>>
        + Send
        + Sync,
{
    fn build(
        &self,
        component: &NormalizedComponent,
        provider: Option<&ProviderInstance>,
        tool: Option<&ToolInstance>,
    ) -> Result<Arc<dyn Component>> {
        self(component, provider, tool)
    }
}

/// Resolved runtime objects for a single `GraphDefinition`.
pub struct Resolved {
    pub providers: HashMap<String, ProviderInstance>,
    pub tools: HashMap<String, ToolInstance>,
    pub components: HashMap<String, Arc<dyn Component>>,
}

/// Dispatch tables plus resolution caches. Resolution order for a graph is
/// fixed: providers, then tools (passing their provider instance), then
/// components (passing provider + tool instances).
#[derive(Default)]
pub struct Registry {
    provider_factories: HashMap<String, Arc<dyn ProviderFactory>>,
    tool_factories: HashMap<String, Arc<dyn ToolFactory>>,
    component_factories: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider_factory(&mut self, kind: impl Into<String>, factory: Arc<dyn ProviderFactory>) {
        self.provider_factories.insert(kind.into(), factory);
    }

    pub fn register_tool_factory(&mut self, kind: impl Into<String>, factory: Arc<dyn ToolFactory>) {
        self.tool_factories.insert(kind.into(), factory);
    }

    pub fn register_component_factory(&mut self, kind: impl Into<String>, factory: Arc<dyn ComponentFactory>) {
        self.component_factories.insert(kind.into(), factory);
    }

    pub fn materialize(&self, ir: &crate::ir::Ir) -> Result<Resolved> {
        let mut providers = HashMap::new();
        for (id, desc) in &ir.providers {
            let factory = self.provider_factories.get(&desc.kind).ok_or_else(|| {
                GraphError::Ir(IrError::new(
                    "ERR_PROVIDER_FACTORY_NOT_FOUND",
                    format!("no provider factory registered for type '{}'", desc.kind),
                    format!("/providers/{id}"),
                ))
            })?;
            providers.insert(id.clone(), factory.build(desc)?);
        }

        let mut tools = HashMap::new();
        for (id, desc) in &ir.tools {
            let factory = self.tool_factories.get(&desc.kind).ok_or_else(|| {
                GraphError::Ir(IrError::new(
                    "ERR_TOOL_FACTORY_NOT_FOUND",
                    format!("no tool factory registered for type '{}'", desc.kind),
                    format!("/tools/{id}"),
                ))
            })?;
            let provider = desc.provider_id.as_ref().and_then(|p| providers.get(p));
            let instance = factory.build(desc, provider)?;
            tools.insert(id.clone(), instance);
        }

        let mut components = HashMap::new();
        for (id, desc) in &ir.components {
            let factory = self.component_factories.get(&desc.kind).ok_or_else(|| {
                GraphError::Ir(IrError::new(
                    "ERR_COMPONENT_FACTORY_NOT_FOUND",
                    format!("no component factory registered for type '{}'", desc.kind),
                    format!("/components/{id}"),
                ))
            })?;
            let provider = desc.provider_id.as_ref().and_then(|p| providers.get(p));
            let tool = desc.tool_id.as_ref().and_then(|t| tools.get(t));
            components.insert(id.clone(), factory.build(desc, provider, tool)?);
        }

        Ok(Resolved { providers, tools, components })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    struct Echo;

    #[async_trait]
    impl Component for Echo {
        async fn call(
            &self,
            _state: &StateView,
            inputs: &Map<String, JsonValue>,
            _ctx: &mut ComponentContext,
        ) -> Result<JsonValue> {
            Ok(JsonValue::Object(inputs.clone().into_iter().collect()))
        }
    }

    #[test]
    fn materializes_in_dependency_order() {
        let mut registry = Registry::new();
        registry.register_provider_factory("static", Arc::new(|_p: &NormalizedProvider| Ok(ProviderInstance::new())));
        registry.register_tool_factory("static", Arc::new(|_t: &NormalizedTool, _p: Option<&ProviderInstance>| {
            Ok(ToolInstance::default())
        }));
        registry.register_component_factory(
            "static",
            Arc::new(|_c: &NormalizedComponent, _p: Option<&ProviderInstance>, _t: Option<&ToolInstance>| {
                Ok(Arc::new(Echo) as Arc<dyn Component>)
            }),
        );

        let mut ir_providers = Map::new();
        ir_providers.insert(
            "p1".to_string(),
            NormalizedProvider { id: "p1".into(), kind: "static".into(), config: Map::new() },
        );
        let mut ir_components = Map::new();
        ir_components.insert(
            "c1".to_string(),
            NormalizedComponent {
                id: "c1".into(),
                kind: "static".into(),
                provider_id: Some("p1".into()),
                tool_id: None,
                inputs: Map::new(),
                outputs: Map::new(),
                config: Map::new(),
            },
        );

        let ir = crate::ir::Ir {
            version: None,
            runtime: crate::ir::NormalizedRuntime { engine: "lc.lcel".into(), default_provider: None },
            providers: ir_providers,
            tools: Map::new(),
            components: ir_components,
            graph: crate::ir::NormalizedGraph {
                entry_id: "c1".into(),
                nodes: Map::new(),
                outputs: Vec::new(),
            },
            policies: Map::new(),
            histories: Map::new(),
        };

        let resolved = registry.materialize(&ir).unwrap();
        assert!(resolved.providers.contains_key("p1"));
        assert!(resolved.components.contains_key("c1"));
    }

    #[test]
    fn missing_factory_is_fatal() {
        let registry = Registry::new();
        let mut ir_providers = Map::new();
        ir_providers.insert(
            "p1".to_string(),
            NormalizedProvider { id: "p1".into(), kind: "unregistered".into(), config: Map::new() },
        );
        let ir = crate::ir::Ir {
            version: None,
            runtime: crate::ir::NormalizedRuntime { engine: "lc.lcel".into(), default_provider: None },
            providers: ir_providers,
            tools: Map::new(),
            components: Map::new(),
            graph: crate::ir::NormalizedGraph {
                entry_id: "x".into(),
                nodes: Map::new(),
                outputs: Vec::new(),
            },
            policies: Map::new(),
            histories: Map::new(),
        };
        let err = registry.materialize(&ir).unwrap_err();
        assert_eq!(err.code(), "ERR_PROVIDER_FACTORY_NOT_FOUND");
    }
}
