//! Roles and the access gate.
//!
//! The gate is a pure function over a policy snapshot supplied by the
//! access-control collaborator: owner first, then explicit ACL entry, then
//! the document's link-sharing default. Permissions are a closed capability
//! table over the four roles — no scattered runtime conditionals.

use serde::{Deserialize, Serialize};

/// Effective role of a user on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Owner,
    Editor,
    Commenter,
    Viewer,
}

impl Role {
    /// Capability table: which roles may submit body-mutating operations
    /// (insert / delete / format-range).
    pub fn may_edit_body(self) -> bool {
        match self {
            Role::Owner | Role::Editor => true,
            Role::Commenter | Role::Viewer => false,
        }
    }

    /// Snapshot restore is an owner-only administrative operation.
    pub fn may_restore(self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Commenter => "commenter",
            Role::Viewer => "viewer",
        };
        write!(f, "{s}")
    }
}

/// Link-sharing default for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkAccess {
    /// Anyone with the link gets this role.
    Role(Role),
    /// Link sharing disabled.
    None,
}

impl Default for LinkAccess {
    fn default() -> Self {
        LinkAccess::None
    }
}

/// One document's access policy, snapshotted from the access-control
/// collaborator at connection time.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    /// The document owner's user id, if known.
    pub owner: Option<String>,
    /// Explicit ACL entry for the connecting user, if any.
    pub explicit: Option<Role>,
    /// Link-sharing fallback.
    pub link: LinkAccess,
}

/// Resolve a connecting user's effective role. `None` means denied.
///
/// The owner always gets [`Role::Owner`]; otherwise the explicit ACL entry
/// wins; otherwise the link default applies unless it is
/// [`LinkAccess::None`].
pub fn authorize(policy: &AccessPolicy, user_id: &str) -> Option<Role> {
    if policy.owner.as_deref() == Some(user_id) {
        return Some(Role::Owner);
    }
    if let Some(role) = policy.explicit {
        return Some(role);
    }
    match policy.link {
        LinkAccess::Role(role) => Some(role),
        LinkAccess::None => None,
    }
}
