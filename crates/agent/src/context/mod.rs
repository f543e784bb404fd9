//! Conversation context assembly.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`NodeCache`] | Per-message derived state, populated once under a per-node lock |
//! | [`ContextAssembler`] | Walks the reply chain and renders budgeted turns |
//! | [`UserWarnings`] | Deduplicated notices about anything cut or skipped |

pub mod assembler;
pub mod node_cache;
pub mod warnings;

pub use assembler::{
    AssembledContext, AssemblyInput, ContextAssembler, ContextFlags, ContextLimits,
};
pub use node_cache::{MessageNode, NodeCache, NodeHandle};
pub use warnings::{UserWarnings, Warning};
