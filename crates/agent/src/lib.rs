//! Reply generation for replychain.
//!
//! The flow for one triggering chat message:
//!
//! 1. **Gate** it (bots ignored, mention required outside DMs, access policy)
//! 2. **Assemble** the conversation by walking its reply chain through the
//!    shared [`NodeCache`]
//! 3. **Prompt**: system turn first, then the conversation oldest first
//! 4. **Stream** the completion through the [`ThinkRedactor`] into a
//!    [`ReplySink`], paginating and re-rendering as text arrives
//!
//! The cache outlives individual replies and is shared by every concurrent
//! one; everything else is per reply.

pub mod context;
pub mod pipeline;
pub mod prompt;
pub mod reasoning;
pub mod reply;
pub mod responder;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{
    AssembledContext, AssemblyInput, ContextAssembler, ContextFlags, ContextLimits, MessageNode,
    NodeCache, UserWarnings, Warning,
};
pub use pipeline::{PipelineOutcome, ReplyPipeline, ReplyServices, SkipReason};
pub use prompt::{build_completion_request, format_system_prompt, users_listing};
pub use reasoning::{Redacted, ThinkRedactor, collapse_think_blocks};
pub use reply::{ReplyFrame, ReplyPage, ReplyStyle, ThinkingClock, paginate};
pub use responder::{ReplyOutcome, ReplySettings, ReplySink, ResponseStreamer};
