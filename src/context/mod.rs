//! What an agent run starts from: the tenant's identity, the assembled
//! retrieval context, and the activity timeline.

mod assembler;
mod identity;
mod timeline;

pub use assembler::{AssembledContext, AssemblerConfig, ContextAssembler};
pub use identity::{Identity, IdentityService, Persona, PersonaStyle, default_tool_scopes};
pub use timeline::{
    MAX_DAYS, SUMMARY_RECENT, TimelineError, TimelineService, TimelineSummary, clamp_days,
};
