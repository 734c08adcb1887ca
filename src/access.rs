use crate::engine::EngineError;
use crate::model::{Actor, Role};

/// Roles allowed to approve, reject, assign, pick a vehicle up front,
/// or book on someone else's behalf.
pub const APPROVERS: &[Role] = &[Role::Manager, Role::Admin];

/// The single capability gate every restricted operation goes through.
pub fn require_any_role(actor: &Actor, roles: &[Role], action: &'static str) -> Result<(), EngineError> {
    if roles.contains(&actor.role) {
        Ok(())
    } else {
        Err(EngineError::Forbidden {
            actor: actor.id,
            role: actor.role,
            action,
        })
    }
}

pub fn is_approver(actor: &Actor) -> bool {
    APPROVERS.contains(&actor.role)
}
