//! Security policies for replychain.
//!
//! - [`allowlist`]: decides whether a message author may use the bot here
//! - [`response`]: decides whether generated text may be shown at all

pub mod allowlist;
pub mod response;

pub use allowlist::{AccessDecision, AccessPolicy, AccessRequest};
pub use response::{PolicyVerdict, ResponsePolicy};
