//! Access-control collaborator interface.
//!
//! ACL storage and its REST surface live outside this backend; the gateway
//! consumes them through [`AccessProvider`] only, snapshots a per-document
//! [`AccessPolicy`], and lets the pure gate in `tandem-core` decide.

use std::collections::HashMap;
use std::sync::RwLock;

use tandem_core::access::{AccessPolicy, LinkAccess, Role};

/// Read-only view of the external access-control system.
pub trait AccessProvider: Send + Sync {
    /// The document owner's user id, if the document is known.
    fn owner_of(&self, document_id: &str) -> Option<String>;

    /// Explicit ACL role for a user on a document.
    fn get_role(&self, document_id: &str, user_id: &str) -> Option<Role>;

    /// Link-sharing default for a document.
    fn get_link_access(&self, document_id: &str) -> LinkAccess;

    /// Snapshot the policy inputs for one `(document, user)` pair.
    fn policy_for(&self, document_id: &str, user_id: &str) -> AccessPolicy {
        AccessPolicy {
            owner: self.owner_of(document_id),
            explicit: self.get_role(document_id, user_id),
            link: self.get_link_access(document_id),
        }
    }
}

/// In-memory [`AccessProvider`] for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticAcl {
    inner: RwLock<StaticAclInner>,
}

#[derive(Debug, Default)]
struct StaticAclInner {
    owners: HashMap<String, String>,
    entries: HashMap<(String, String), Role>,
    link_access: HashMap<String, LinkAccess>,
}

impl StaticAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, document_id: impl Into<String>, user_id: impl Into<String>) {
        let mut inner = self.inner.write().expect("acl lock poisoned");
        inner.owners.insert(document_id.into(), user_id.into());
    }

    pub fn grant(
        &self,
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
    ) {
        let mut inner = self.inner.write().expect("acl lock poisoned");
        inner
            .entries
            .insert((document_id.into(), user_id.into()), role);
    }

    pub fn set_link_access(&self, document_id: impl Into<String>, access: LinkAccess) {
        let mut inner = self.inner.write().expect("acl lock poisoned");
        inner.link_access.insert(document_id.into(), access);
    }
}

impl AccessProvider for StaticAcl {
    fn owner_of(&self, document_id: &str) -> Option<String> {
        let inner = self.inner.read().expect("acl lock poisoned");
        inner.owners.get(document_id).cloned()
    }

    fn get_role(&self, document_id: &str, user_id: &str) -> Option<Role> {
        let inner = self.inner.read().expect("acl lock poisoned");
        inner
            .entries
            .get(&(document_id.to_string(), user_id.to_string()))
            .copied()
    }

    fn get_link_access(&self, document_id: &str) -> LinkAccess {
        let inner = self.inner.read().expect("acl lock poisoned");
        inner
            .link_access
            .get(document_id)
            .copied()
            .unwrap_or(LinkAccess::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::access::authorize;

    #[test]
    fn test_policy_snapshot_feeds_the_gate() {
        let acl = StaticAcl::new();
        acl.set_owner("doc", "alice");
        acl.grant("doc", "bob", Role::Editor);
        acl.set_link_access("doc", LinkAccess::Role(Role::Viewer));

        assert_eq!(
            authorize(&acl.policy_for("doc", "alice"), "alice"),
            Some(Role::Owner)
        );
        assert_eq!(
            authorize(&acl.policy_for("doc", "bob"), "bob"),
            Some(Role::Editor)
        );
        // Link default catches everyone else.
        assert_eq!(
            authorize(&acl.policy_for("doc", "carol"), "carol"),
            Some(Role::Viewer)
        );
    }

    #[test]
    fn test_unknown_document_denies() {
        let acl = StaticAcl::new();
        assert_eq!(authorize(&acl.policy_for("ghost", "alice"), "alice"), None);
    }
}
