//! Role-based access control with per-server stack-pattern grants.
//!
//! Admin-scope permissions are granted to a role globally. User-scope permissions are
//! granted per `(role, server, stack pattern)` and combine as a plain OR. A role with
//! the admin flag holds every permission. API keys narrow whatever their owner holds
//! to the key's scopes.

mod pattern;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use pattern::{Specificity, matches_pattern, pattern_specificity, validate_pattern};

use crate::error::Result;
use crate::store::Store;
use crate::types::{ApiKeyScope, Permission, PermissionScope, StackPermission};

/// Who is asking: a user, optionally acting through an API key.
#[derive(Debug, Clone)]
pub struct Subject {
    pub user_id: i64,
    /// Present when the request authenticated with an API key.
    pub key_scopes: Option<Vec<ApiKeyScope>>,
}

impl Subject {
    #[must_use]
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            key_scopes: None,
        }
    }
}

/// What a permission is being exercised on.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Global,
    /// Any stack on the server.
    Server(i64),
    Stack(i64, &'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
    /// The user may hold the permission but the API key was not scoped for it.
    OutOfScope,
}

impl Access {
    #[must_use]
    pub fn is_granted(self) -> bool {
        self == Access::Granted
    }
}

fn scope_covers(scope: &ApiKeyScope, permission: Permission, target: Target<'_>) -> bool {
    if scope.permission != permission.name() {
        return false;
    }
    match target {
        Target::Global => scope.server_id.is_none() && scope.stack_pattern == "*",
        Target::Server(sid) => scope.server_id.is_none_or(|s| s == sid),
        Target::Stack(sid, stack) => {
            scope.server_id.is_none_or(|s| s == sid) && matches_pattern(stack, &scope.stack_pattern)
        }
    }
}

/// Whether a key's scopes allow `permission` on `target`.
#[must_use]
pub fn scopes_allow(scopes: &[ApiKeyScope], permission: Permission, target: Target<'_>) -> bool {
    scopes.iter().any(|s| scope_covers(s, permission, target))
}

pub struct Rbac {
    store: Arc<dyn Store>,
}

impl Rbac {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn has_role(&self, user_id: i64, role_name: &str) -> Result<bool> {
        Ok(self
            .store
            .list_user_roles(user_id)?
            .iter()
            .any(|r| r.name == role_name))
    }

    pub fn is_admin(&self, user_id: i64) -> Result<bool> {
        self.store.user_is_admin(user_id)
    }

    /// True if any of the user's roles grants `permission` anywhere.
    pub fn has_permission_by_name(&self, user_id: i64, permission: Permission) -> Result<bool> {
        if self.is_admin(user_id)? {
            return Ok(true);
        }
        if self
            .store
            .user_has_role_permission(user_id, permission.name())?
        {
            return Ok(true);
        }
        if permission.scope() == PermissionScope::Admin {
            return Ok(false);
        }
        Ok(self
            .store
            .list_user_stack_permissions(user_id, None)?
            .iter()
            .any(|g| g.permission == permission.name()))
    }

    pub fn user_has_stack_permission(
        &self,
        user_id: i64,
        server_id: i64,
        stack_name: &str,
        permission: Permission,
    ) -> Result<bool> {
        if self.is_admin(user_id)? {
            return Ok(true);
        }
        Ok(self
            .store
            .list_user_stack_permissions(user_id, Some(server_id))?
            .iter()
            .any(|g| {
                g.permission == permission.name() && matches_pattern(stack_name, &g.stack_pattern)
            }))
    }

    pub fn user_has_any_stack_permission(
        &self,
        user_id: i64,
        server_id: i64,
        permission: Permission,
    ) -> Result<bool> {
        if self.is_admin(user_id)? {
            return Ok(true);
        }
        Ok(self
            .store
            .list_user_stack_permissions(user_id, Some(server_id))?
            .iter()
            .any(|g| g.permission == permission.name()))
    }

    /// Servers on which the user holds at least one grant. Admins see every server.
    pub fn user_accessible_server_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        if self.is_admin(user_id)? {
            return Ok(self.store.list_servers()?.iter().map(|s| s.id).collect());
        }
        let ids: BTreeSet<i64> = self
            .store
            .list_user_stack_permissions(user_id, None)?
            .iter()
            .map(|g| g.server_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// The most specific grant behind a stack decision, for audit display.
    pub fn matching_grant(
        &self,
        user_id: i64,
        server_id: i64,
        stack_name: &str,
        permission: Permission,
    ) -> Result<Option<StackPermission>> {
        Ok(self
            .store
            .list_user_stack_permissions(user_id, Some(server_id))?
            .into_iter()
            .filter(|g| {
                g.permission == permission.name() && matches_pattern(stack_name, &g.stack_pattern)
            })
            .max_by_key(|g| pattern_specificity(&g.stack_pattern)))
    }

    /// Whether the subject may see the server at all.
    pub fn can_access_server(&self, subject: &Subject, server_id: i64) -> Result<bool> {
        if let Some(scopes) = &subject.key_scopes {
            if !scopes.iter().any(|s| s.server_id.is_none_or(|sid| sid == server_id)) {
                return Ok(false);
            }
        }
        Ok(self
            .user_accessible_server_ids(subject.user_id)?
            .contains(&server_id))
    }

    /// Full decision for a subject: key scope first, then the owner's grants.
    pub fn check(
        &self,
        subject: &Subject,
        target: Target<'_>,
        permission: Permission,
    ) -> Result<Access> {
        if let Some(scopes) = &subject.key_scopes {
            if !scopes_allow(scopes, permission, target) {
                return Ok(Access::OutOfScope);
            }
            if permission.is_api_key_only() {
                return Ok(Access::Granted);
            }
        }

        let user_id = subject.user_id;
        let granted = match (permission.scope(), target) {
            (PermissionScope::Admin, _) | (PermissionScope::User, Target::Global) => {
                self.has_permission_by_name(user_id, permission)?
            }
            (PermissionScope::User, Target::Server(sid)) => {
                self.user_has_any_stack_permission(user_id, sid, permission)?
            }
            (PermissionScope::User, Target::Stack(sid, stack)) => {
                self.user_has_stack_permission(user_id, sid, stack, permission)?
            }
        };

        Ok(if granted {
            Access::Granted
        } else {
            Access::Denied
        })
    }
}
