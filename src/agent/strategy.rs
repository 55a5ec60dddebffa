//! Scene-keyed execution strategies.

use crate::models::Scene;

/// How a task is approached: which tools it may use and how the persona is
/// steered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub allowed_tools: &'static [&'static str],
    pub system_prompt_suffix: &'static str,
}

impl Strategy {
    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.contains(&tool)
    }
}

pub const CHAT: Strategy = Strategy {
    name: "chat",
    allowed_tools: &[
        "ask_video",
        "search_videos",
        "get_video_summary",
        "submit_content",
        "current_time",
    ],
    system_prompt_suffix: "You are a friendly assistant focused on helping the user understand \
and revisit the videos they have watched.",
};

pub const RESEARCH: Strategy = Strategy {
    name: "research",
    allowed_tools: &[
        "ask_video",
        "search_videos",
        "search_graph",
        "deep_web_research",
        "generate_report",
        "current_time",
        "http_request",
        "echo",
        "sleep",
        "shell",
    ],
    system_prompt_suffix: "You are a research analyst who combines the user's library with \
information from the web. When a question needs up-to-date information, call \
deep_web_research first.",
};

pub const TIMELINE: Strategy = Strategy {
    name: "timeline",
    allowed_tools: &[
        "timeline_query",
        "get_timeline_summary",
        "search_videos",
        "current_time",
    ],
    system_prompt_suffix: "You pay attention to how the user's learning has changed over time \
and help them spot patterns and reflect on them.",
};

/// Strategy for a scene. Scenes without their own strategy borrow the
/// closest one; anything else is chat.
pub fn select(scene: Scene) -> Strategy {
    match scene {
        Scene::Research | Scene::Graph | Scene::Console => RESEARCH,
        Scene::Timeline => TIMELINE,
        Scene::Chat | Scene::Video | Scene::Library => CHAT,
    }
}

/// Strategy by name, falling back to chat.
pub fn by_name(name: &str) -> Strategy {
    match name {
        "research" => RESEARCH,
        "timeline" => TIMELINE,
        _ => CHAT,
    }
}
