use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::limits::MAX_LOGIN_LEN;
use crate::model::Actor;
use crate::registry::ResourceRegistry;

/// Map a login name to the caller. The login is a user id; the role comes
/// from that user's registry record. Unknown and deactivated users get `None`.
pub fn resolve_login(registry: &dyn ResourceRegistry, login: &str) -> Option<Actor> {
    if login.len() > MAX_LOGIN_LEN {
        return None;
    }
    let id = Ulid::from_string(login.trim()).ok()?;
    registry
        .user(&id)
        .filter(|u| u.active)
        .map(|u| Actor::new(u.id, u.role))
}

pub fn login_refused(login: &str) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        format!("login {login:?} is not an active user id"),
    )))
}

/// Shared-password auth gated on the user registry, so every session has
/// a known caller.
pub struct FleetAuthSource {
    password: String,
    registry: Arc<dyn ResourceRegistry>,
}

impl std::fmt::Debug for FleetAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetAuthSource").finish_non_exhaustive()
    }
}

impl FleetAuthSource {
    pub fn new(password: String, registry: Arc<dyn ResourceRegistry>) -> Self {
        Self { password, registry }
    }
}

#[async_trait]
impl AuthSource for FleetAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if resolve_login(self.registry.as_ref(), user).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::debug!(user, "rejected login");
            return Err(login_refused(user));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::registry::{InMemoryRegistry, User};

    fn registry_with(role: Role) -> (InMemoryRegistry, Ulid) {
        let registry = InMemoryRegistry::new();
        let id = Ulid::new();
        registry.upsert_user(User {
            id,
            name: "Rina".into(),
            role,
            active: true,
        });
        (registry, id)
    }

    #[test]
    fn role_comes_from_registry() {
        let (registry, id) = registry_with(Role::User);
        let actor = resolve_login(&registry, &id.to_string()).unwrap();
        assert_eq!(actor, Actor::new(id, Role::User));

        // A role written into the login buys nothing.
        assert!(resolve_login(&registry, &format!("admin:{id}")).is_none());
    }

    #[test]
    fn unknown_and_inactive_users_are_refused() {
        let (registry, id) = registry_with(Role::Manager);
        assert!(resolve_login(&registry, &Ulid::new().to_string()).is_none());
        assert!(resolve_login(&registry, "not-a-ulid").is_none());
        assert!(resolve_login(&registry, &"x".repeat(MAX_LOGIN_LEN + 1)).is_none());

        registry.deactivate_user(&id);
        assert!(resolve_login(&registry, &id.to_string()).is_none());
    }
}
