//! Allowlist policies: who may talk to the bot, and where.
//!
//! Users are checked against user and role lists, the message's channel
//! (plus its parent and category) against channel lists. Admins bypass the
//! allowlists but not the blocklists.

use replychain_config::PermissionsConfig;
use replychain_core::channel::ChatMessage;

/// Result of checking a message author against the permissions.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessDecision {
    Allowed,
    Denied { user_id: u64, reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// The identity facts a decision is made on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub user_id: u64,
    pub role_ids: Vec<u64>,
    /// The channel, its parent (for threads) and its category
    pub channel_ids: Vec<u64>,
    pub is_dm: bool,
}

impl AccessRequest {
    pub fn from_message(message: &ChatMessage) -> Self {
        let channel = &message.channel;
        let channel_ids = [Some(channel.id), channel.parent_id, channel.category_id]
            .into_iter()
            .flatten()
            .map(|id| id.0)
            .collect();
        Self {
            user_id: message.author.id.0,
            role_ids: message.author.role_ids.clone(),
            channel_ids,
            is_dm: message.is_private(),
        }
    }
}

/// Unified allowlist policy enforcement.
pub struct AccessPolicy;

impl AccessPolicy {
    /// Check a request against the configured permissions.
    ///
    /// Rules:
    /// - With no user allowlist (and, outside DMs, no role allowlist) everyone
    ///   is a candidate user
    /// - Block lists always win
    /// - DMs are allowed when `allow_dms` is set (admins always)
    /// - Guild channels are allowed when no channel allowlist is configured or
    ///   any of the channel/parent/category ids is listed
    pub fn check(
        permissions: &PermissionsConfig,
        allow_dms: bool,
        request: &AccessRequest,
    ) -> AccessDecision {
        let users = &permissions.users;
        let roles = &permissions.roles;
        let channels = &permissions.channels;

        let is_admin = users.admin_ids.contains(&request.user_id);
        let has_role = |ids: &[u64]| request.role_ids.iter().any(|r| ids.contains(r));
        let in_channel = |ids: &[u64]| request.channel_ids.iter().any(|c| ids.contains(c));

        let allow_all_users = if request.is_dm {
            users.allowed_ids.is_empty()
        } else {
            users.allowed_ids.is_empty() && roles.allowed_ids.is_empty()
        };
        let is_good_user = is_admin
            || allow_all_users
            || users.allowed_ids.contains(&request.user_id)
            || has_role(&roles.allowed_ids);

        if !is_good_user {
            return Self::deny(request, "user is not in the allowlist");
        }
        if users.blocked_ids.contains(&request.user_id) || has_role(&roles.blocked_ids) {
            return Self::deny(request, "user or one of their roles is blocked");
        }

        let is_good_channel = if request.is_dm {
            is_admin || allow_dms
        } else {
            channels.allowed_ids.is_empty() || in_channel(&channels.allowed_ids)
        };

        if !is_good_channel {
            let reason = if request.is_dm {
                "direct messages are disabled"
            } else {
                "channel is not in the allowlist"
            };
            return Self::deny(request, reason);
        }
        if in_channel(&channels.blocked_ids) {
            return Self::deny(request, "channel is blocked");
        }

        AccessDecision::Allowed
    }

    fn deny(request: &AccessRequest, reason: &str) -> AccessDecision {
        tracing::debug!(user_id = request.user_id, reason, "Access denied");
        AccessDecision::Denied {
            user_id: request.user_id,
            reason: reason.into(),
        }
    }
}
