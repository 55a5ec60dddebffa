//! Which tools a scene gets: `tools.yaml` entries applied to the router,
//! then scene defaults, allowlists and the role policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::models::{Scene, UserRole};
use crate::tools::{Tool, ToolCategory, ToolPolicy, ToolRouter};

pub struct ToolCatalog {
    router: Arc<ToolRouter>,
    config: ToolsConfig,
}

impl ToolCatalog {
    /// Register the enabled entries of `config` from `available` (keyed by
    /// `impl`). An empty config registers everything in `available`.
    pub fn new(
        router: Arc<ToolRouter>,
        config: ToolsConfig,
        available: BTreeMap<String, Arc<dyn Tool>>,
    ) -> Self {
        if config.tools.is_empty() {
            for tool in available.into_values() {
                router.register(tool);
            }
            return Self { router, config };
        }

        for entry in &config.tools {
            if !entry.enabled {
                tracing::debug!(tool = %entry.name, "Tool disabled in config");
                continue;
            }
            let Some(tool) = available.get(&entry.impl_key) else {
                tracing::warn!(tool = %entry.name, impl_key = %entry.impl_key, "No implementation for configured tool");
                continue;
            };
            if tool.name() != entry.name {
                tracing::warn!(
                    tool = %entry.name,
                    impl_name = %tool.name(),
                    "Configured tool name does not match its implementation, skipping"
                );
                continue;
            }
            if entry.is_unsafe && tool.category() != ToolCategory::Unsafe {
                tracing::warn!(tool = %entry.name, "Tool marked unsafe in config but not by its implementation");
            }
            router.register(Arc::clone(tool));
            router.declare_scenes(entry.name.clone(), entry.scenes.clone());
        }
        Self { router, config }
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    fn is_unsafe(&self, name: &str) -> bool {
        self.config.entry(name).is_some_and(|e| e.is_unsafe)
            || self.router.category_of(name) == Some(ToolCategory::Unsafe)
    }

    /// Names the scene offers before any allowlist: its `scene_defaults`,
    /// or every registered tool when the scene has none.
    pub fn scene_tools(&self, scene: Scene) -> Vec<String> {
        match self.config.scene_defaults.get(&scene) {
            Some(names) => names
                .iter()
                .filter(|name| self.router.contains(name))
                .cloned()
                .collect(),
            None => self.router.names(),
        }
    }

    /// Scene defaults ∩ `allowlist`, without unsafe tools unless asked,
    /// filtered by the role policy.
    pub fn create_tools(
        &self,
        scene: Scene,
        tenant_id: Option<i64>,
        role: UserRole,
        allowlist: Option<&BTreeSet<String>>,
        include_unsafe: bool,
    ) -> Vec<Arc<dyn Tool>> {
        let policy = ToolPolicy::default().with_unsafe(include_unsafe);
        let tools: Vec<Arc<dyn Tool>> = self
            .scene_tools(scene)
            .into_iter()
            .filter(|name| allowlist.is_none_or(|set| set.contains(name)))
            .filter(|name| include_unsafe || !self.is_unsafe(name))
            .filter(|name| self.router.is_visible_with(&policy, name, scene, role))
            .filter_map(|name| self.router.get(&name))
            .collect();
        tracing::debug!(
            scene = %scene.as_str(),
            tenant_id,
            count = tools.len(),
            "Created tools for scene"
        );
        tools
    }

    pub fn create_tool_names(
        &self,
        scene: Scene,
        tenant_id: Option<i64>,
        role: UserRole,
        allowlist: Option<&BTreeSet<String>>,
        include_unsafe: bool,
    ) -> BTreeSet<String> {
        self.create_tools(scene, tenant_id, role, allowlist, include_unsafe)
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }
}
