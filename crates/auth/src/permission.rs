//! Role and permission evaluation.
//!
//! Permissions are namespaced `resource:action` strings. Roles expand to
//! permission sets once at table construction; evaluation is synchronous
//! over the cached expansion. `super:admin` bypasses everything and
//! `resource:*` matches any action under that resource.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use voxgate_core::Role;

/// Permission string constants for the fixed catalog.
pub mod perms {
    pub const SUPER_ADMIN: &str = "super:admin";

    pub const USER_CREATE: &str = "user:create";
    pub const USER_READ: &str = "user:read";
    pub const USER_UPDATE: &str = "user:update";
    pub const USER_DELETE: &str = "user:delete";
    pub const USER_LIST: &str = "user:list";
    pub const USER_INVITE: &str = "user:invite";

    pub const ORG_READ: &str = "org:read";
    pub const ORG_UPDATE: &str = "org:update";
    pub const ORG_BILLING: &str = "org:billing";
    pub const ORG_AUDIT_LOGS: &str = "org:audit_logs";

    pub const VOICE_AGENT_CREATE: &str = "voice_agent:create";
    pub const VOICE_AGENT_READ: &str = "voice_agent:read";
    pub const VOICE_AGENT_UPDATE: &str = "voice_agent:update";
    pub const VOICE_AGENT_DELETE: &str = "voice_agent:delete";
    pub const VOICE_AGENT_DEPLOY: &str = "voice_agent:deploy";

    pub const CONVERSATION_READ: &str = "conversation:read";
    pub const CONVERSATION_LIST: &str = "conversation:list";
    pub const CONVERSATION_EXPORT: &str = "conversation:export";
    pub const CONVERSATION_DELETE: &str = "conversation:delete";

    pub const VOICE_SESSION_START: &str = "voice_session:start";
    pub const VOICE_SESSION_SYNTHESIZE: &str = "voice_session:synthesize";

    pub const LEAD_CREATE: &str = "lead:create";
    pub const LEAD_READ: &str = "lead:read";
    pub const LEAD_UPDATE: &str = "lead:update";
    pub const LEAD_ASSIGN: &str = "lead:assign";

    pub const ANALYTICS_READ: &str = "analytics:read";
    pub const ANALYTICS_EXPORT: &str = "analytics:export";

    pub const API_READ: &str = "api:read";
    pub const API_WRITE: &str = "api:write";
    pub const API_KEYS_MANAGE: &str = "api:keys_manage";

    pub const WEBHOOK_CREATE: &str = "webhook:create";
    pub const WEBHOOK_READ: &str = "webhook:read";
    pub const WEBHOOK_UPDATE: &str = "webhook:update";
    pub const WEBHOOK_DELETE: &str = "webhook:delete";
    pub const WEBHOOK_TEST: &str = "webhook:test";

    pub const ADMIN_USERS: &str = "admin:users";
    pub const ADMIN_BILLING: &str = "admin:billing";
    pub const ADMIN_AUDIT: &str = "admin:audit";
}

/// Result of a permission check, with context for 403 responses and audit.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub required: Vec<String>,
    pub held: Vec<String>,
}

/// Does `held` satisfy `required`? Exact match, `resource:*` wildcard, or
/// the super permission.
pub fn permission_satisfied(held: &[String], required: &str) -> bool {
    if held.iter().any(|p| p == perms::SUPER_ADMIN) {
        return true;
    }
    if held.iter().any(|p| p == required) {
        return true;
    }
    if let Some((resource, _)) = required.split_once(':') {
        let wildcard = format!("{resource}:*");
        if held.iter().any(|p| *p == wildcard) {
            return true;
        }
    }
    false
}

/// Read-mostly role → permission-set table with a reload primitive.
#[derive(Clone)]
pub struct RoleTable {
    inner: Arc<RwLock<HashMap<Role, HashSet<String>>>>,
}

impl RoleTable {
    pub fn builtin() -> Self {
        Self {
            inner: Arc::new(RwLock::new(builtin_roles())),
        }
    }

    /// Role expansion plus per-principal extra grants.
    pub fn permissions_for(&self, role: Role, extra: &[String]) -> Vec<String> {
        let table = self.inner.read();
        let mut permissions: HashSet<String> = table.get(&role).cloned().unwrap_or_default();
        permissions.extend(extra.iter().cloned());
        let mut sorted: Vec<String> = permissions.into_iter().collect();
        sorted.sort();
        sorted
    }

    pub fn check(&self, held: &[String], required: &str) -> PermissionCheck {
        PermissionCheck {
            allowed: permission_satisfied(held, required),
            required: vec![required.to_string()],
            held: held.to_vec(),
        }
    }

    /// All listed permissions must be satisfied.
    pub fn check_all(&self, held: &[String], required: &[&str]) -> PermissionCheck {
        PermissionCheck {
            allowed: required.iter().all(|r| permission_satisfied(held, r)),
            required: required.iter().map(|s| s.to_string()).collect(),
            held: held.to_vec(),
        }
    }

    /// Any one of the listed permissions suffices.
    pub fn check_any(&self, held: &[String], required: &[&str]) -> PermissionCheck {
        PermissionCheck {
            allowed: required.iter().any(|r| permission_satisfied(held, r)),
            required: required.iter().map(|s| s.to_string()).collect(),
            held: held.to_vec(),
        }
    }

    /// Swap role definitions; used on config reload.
    pub fn replace(&self, table: HashMap<Role, HashSet<String>>) {
        *self.inner.write() = table;
        tracing::info!("role table reloaded");
    }
}

fn set(perms: &[&str]) -> HashSet<String> {
    perms.iter().map(|s| s.to_string()).collect()
}

/// Built-in role definitions.
fn builtin_roles() -> HashMap<Role, HashSet<String>> {
    use perms::*;

    let viewer = set(&[
        ORG_READ,
        VOICE_AGENT_READ,
        CONVERSATION_READ,
        CONVERSATION_LIST,
        LEAD_READ,
        ANALYTICS_READ,
    ]);

    let mut user = viewer.clone();
    user.extend(set(&[
        VOICE_SESSION_START,
        VOICE_SESSION_SYNTHESIZE,
        LEAD_CREATE,
        LEAD_UPDATE,
        API_READ,
    ]));

    let mut manager = user.clone();
    manager.extend(set(&[
        USER_READ,
        USER_LIST,
        VOICE_AGENT_CREATE,
        VOICE_AGENT_UPDATE,
        VOICE_AGENT_DEPLOY,
        CONVERSATION_EXPORT,
        LEAD_ASSIGN,
        ANALYTICS_EXPORT,
        API_WRITE,
        WEBHOOK_CREATE,
        WEBHOOK_READ,
        WEBHOOK_UPDATE,
        WEBHOOK_TEST,
    ]));

    let mut admin = manager.clone();
    admin.extend(set(&[
        USER_CREATE,
        USER_UPDATE,
        USER_DELETE,
        USER_INVITE,
        ORG_UPDATE,
        ORG_BILLING,
        ORG_AUDIT_LOGS,
        VOICE_AGENT_DELETE,
        CONVERSATION_DELETE,
        API_KEYS_MANAGE,
        WEBHOOK_DELETE,
        ADMIN_USERS,
        ADMIN_BILLING,
        ADMIN_AUDIT,
    ]));

    HashMap::from([
        (Role::TenantViewer, viewer),
        (Role::TenantUser, user.clone()),
        (Role::TenantManager, manager),
        (Role::TenantAdmin, admin.clone()),
        (
            Role::VoiceAgentManager,
            set(&[
                VOICE_AGENT_CREATE,
                VOICE_AGENT_READ,
                VOICE_AGENT_UPDATE,
                VOICE_AGENT_DEPLOY,
                VOICE_SESSION_START,
                VOICE_SESSION_SYNTHESIZE,
                CONVERSATION_READ,
                CONVERSATION_LIST,
            ]),
        ),
        (
            Role::AnalyticsViewer,
            set(&[ANALYTICS_READ, ANALYTICS_EXPORT, CONVERSATION_READ]),
        ),
        (
            Role::ApiUser,
            set(&[API_READ, API_WRITE, VOICE_SESSION_SYNTHESIZE]),
        ),
        (Role::SuperAdmin, set(&[SUPER_ADMIN])),
        (Role::PlatformAdmin, admin),
        (
            Role::SupportAgent,
            set(&[ORG_READ, CONVERSATION_READ, CONVERSATION_LIST, USER_READ, USER_LIST]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(perms: &[&str]) -> Vec<String> {
        perms.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn super_admin_allows_anything() {
        assert!(permission_satisfied(
            &held(&["super:admin"]),
            "voice_agent:delete"
        ));
        assert!(permission_satisfied(&held(&["super:admin"]), "made:up"));
    }

    #[test]
    fn exact_match_allows_exactly_that() {
        let h = held(&["conversation:read"]);
        assert!(permission_satisfied(&h, "conversation:read"));
        assert!(!permission_satisfied(&h, "conversation:delete"));
        assert!(!permission_satisfied(&h, "lead:read"));
    }

    #[test]
    fn wildcard_covers_the_resource_only() {
        let h = held(&["conversation:*"]);
        assert!(permission_satisfied(&h, "conversation:read"));
        assert!(permission_satisfied(&h, "conversation:delete"));
        assert!(!permission_satisfied(&h, "lead:read"));
    }

    #[test]
    fn check_modes() {
        let table = RoleTable::builtin();
        let h = held(&["conversation:read", "analytics:read"]);

        assert!(table
            .check_all(&h, &["conversation:read", "analytics:read"])
            .allowed);
        assert!(!table
            .check_all(&h, &["conversation:read", "lead:read"])
            .allowed);
        assert!(table
            .check_any(&h, &["lead:read", "analytics:read"])
            .allowed);
        assert!(!table.check_any(&h, &["lead:read", "user:read"]).allowed);
    }

    #[test]
    fn denied_check_reports_required_and_held() {
        let table = RoleTable::builtin();
        let h = held(&["conversation:read", "analytics:read"]);
        let check = table.check(&h, perms::VOICE_AGENT_UPDATE);
        assert!(!check.allowed);
        assert_eq!(check.required, vec!["voice_agent:update"]);
        assert_eq!(check.held, h);
    }

    #[test]
    fn role_expansion_is_ordered_and_deduplicated() {
        let table = RoleTable::builtin();
        let perms = table.permissions_for(
            Role::TenantViewer,
            &["conversation:read".to_string(), "custom:thing".to_string()],
        );
        assert!(perms.contains(&"custom:thing".to_string()));
        let mut sorted = perms.clone();
        sorted.sort();
        assert_eq!(perms, sorted);
        assert_eq!(
            perms.iter().filter(|p| *p == "conversation:read").count(),
            1
        );
    }

    #[test]
    fn admin_outranks_manager() {
        let table = RoleTable::builtin();
        let admin = table.permissions_for(Role::TenantAdmin, &[]);
        let manager = table.permissions_for(Role::TenantManager, &[]);
        for p in &manager {
            assert!(admin.contains(p), "admin missing {p}");
        }
        assert!(admin.contains(&perms::API_KEYS_MANAGE.to_string()));
        assert!(!manager.contains(&perms::API_KEYS_MANAGE.to_string()));
    }
}
