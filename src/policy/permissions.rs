//! Permission gate. `allowed = default_allow ∪ allow[component_id]`
//! must be a superset of the component's required permissions before a
//! `tool` node runs.

use std::collections::{HashMap, HashSet};

use crate::error::{GraphError, PolicyError, Result};

#[derive(Debug, Clone, Default)]
pub struct PermissionConfig {
    pub default_allow: HashSet<String>,
    pub allow: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct PermissionManager {
    config: PermissionConfig,
}

impl PermissionManager {
    pub fn new(config: PermissionConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, component_id: &str, required: &[String]) -> Result<()> {
        let mut allowed: HashSet<&str> = self.config.default_allow.iter().map(String::as_str).collect();
        if let Some(extra) = self.config.allow.get(component_id) {
            allowed.extend(extra.iter().map(String::as_str));
        }
        let mut missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|perm| !allowed.contains(perm))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(GraphError::Policy(PolicyError::new(
            "ERR_TOOL_PERMISSION_DENIED",
            format!("component '{component_id}' missing required permissions: {}", missing.join(", ")),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allows_when_default_covers_requirement() {
        let manager = PermissionManager::new(PermissionConfig {
            default_allow: set(&["http"]),
            allow: HashMap::new(),
        });
        manager.check("fetcher", &["http".to_string()]).unwrap();
    }

    #[test]
    fn denies_when_neither_layer_covers_requirement() {
        let manager = PermissionManager::new(PermissionConfig::default());
        let err = manager.check("fetcher", &["http".to_string()]).unwrap_err();
        assert_eq!(err.code(), "ERR_TOOL_PERMISSION_DENIED");
    }

    #[test]
    fn component_specific_allow_is_additive() {
        let mut allow = HashMap::new();
        allow.insert("fetcher".to_string(), set(&["http"]));
        let manager = PermissionManager::new(PermissionConfig { default_allow: HashSet::new(), allow });
        manager.check("fetcher", &["http".to_string()]).unwrap();
        let err = manager.check("other", &["http".to_string()]).unwrap_err();
        assert_eq!(err.code(), "ERR_TOOL_PERMISSION_DENIED");
    }
}
