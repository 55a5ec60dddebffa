//! Tool visibility policy by scene and role.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::tool::ToolCategory;
use crate::models::{Scene, UserRole};

/// Tools hidden unless explicitly allowed.
pub const BLOCKED_BY_DEFAULT: &[&str] = &["shell"];

/// Categories a scene exposes.
pub fn scene_categories(scene: Scene) -> &'static [ToolCategory] {
    use ToolCategory::*;
    match scene {
        Scene::Chat | Scene::Timeline | Scene::Graph => &[Basic],
        Scene::Research => &[Basic, Web, Search],
        Scene::Video | Scene::Library => &[Basic, Search],
        Scene::Console => &[Basic, File, Web, Search, Foreign],
    }
}

/// Categories a role may use.
pub fn role_categories(role: UserRole) -> &'static [ToolCategory] {
    use ToolCategory::*;
    match role {
        UserRole::Admin => &[Basic, File, Web, Search, Foreign, Unsafe],
        UserRole::Normal => &[Basic, Web, Search],
        UserRole::Guest => &[Basic],
    }
}

/// Per-request adjustments on top of the scene and role tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub extra_allowed: BTreeSet<String>,
    #[serde(default)]
    pub extra_blocked: BTreeSet<String>,
    /// Unsafe tools additionally need an admin caller.
    #[serde(default)]
    pub allow_unsafe: bool,
}

impl ToolPolicy {
    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.extra_allowed.insert(name.into());
        self
    }

    pub fn block(mut self, name: impl Into<String>) -> Self {
        self.extra_blocked.insert(name.into());
        self
    }

    pub fn with_unsafe(mut self, allow_unsafe: bool) -> Self {
        self.allow_unsafe = allow_unsafe;
        self
    }

    /// Whether a tool of `category` named `name` may be used.
    pub fn is_visible(
        &self,
        name: &str,
        category: ToolCategory,
        scene: Scene,
        role: UserRole,
    ) -> bool {
        if self.extra_blocked.contains(name) {
            return false;
        }
        if category == ToolCategory::Unsafe {
            return role == UserRole::Admin
                && self.allow_unsafe
                && (scene == Scene::Console || self.extra_allowed.contains(name));
        }
        if self.extra_allowed.contains(name) {
            return true;
        }
        if BLOCKED_BY_DEFAULT.contains(&name) {
            return false;
        }
        scene_categories(scene).contains(&category) && role_categories(role).contains(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_normal_sees_basic_only() {
        let policy = ToolPolicy::default();
        assert!(policy.is_visible("echo", ToolCategory::Basic, Scene::Chat, UserRole::Normal));
        assert!(!policy.is_visible(
            "http_request",
            ToolCategory::Web,
            Scene::Chat,
            UserRole::Normal
        ));
        assert!(!policy.is_visible("shell", ToolCategory::Unsafe, Scene::Chat, UserRole::Normal));
    }

    #[test]
    fn test_role_narrows_scene() {
        let policy = ToolPolicy::default();
        assert!(policy.is_visible(
            "deep_web_research",
            ToolCategory::Search,
            Scene::Research,
            UserRole::Normal
        ));
        assert!(!policy.is_visible(
            "deep_web_research",
            ToolCategory::Search,
            Scene::Research,
            UserRole::Guest
        ));
    }

    #[test]
    fn test_unsafe_needs_admin_and_flag() {
        let policy = ToolPolicy::default();
        assert!(!policy.is_visible("shell", ToolCategory::Unsafe, Scene::Console, UserRole::Admin));

        let enabled = ToolPolicy::default().with_unsafe(true);
        assert!(enabled.is_visible("shell", ToolCategory::Unsafe, Scene::Console, UserRole::Admin));
        assert!(!enabled.is_visible(
            "shell",
            ToolCategory::Unsafe,
            Scene::Console,
            UserRole::Normal
        ));

        // extra_allowed alone never unlocks an unsafe tool
        let allowed = ToolPolicy::default().allow("shell");
        assert!(!allowed.is_visible("shell", ToolCategory::Unsafe, Scene::Chat, UserRole::Admin));
        let both = allowed.with_unsafe(true);
        assert!(both.is_visible("shell", ToolCategory::Unsafe, Scene::Chat, UserRole::Admin));
    }

    #[test]
    fn test_extra_lists() {
        let policy = ToolPolicy::default().allow("http_request").block("echo");
        assert!(policy.is_visible(
            "http_request",
            ToolCategory::Web,
            Scene::Chat,
            UserRole::Guest
        ));
        assert!(!policy.is_visible("echo", ToolCategory::Basic, Scene::Chat, UserRole::Admin));
    }
}
