use ulid::Ulid;

use crate::model::{BookingStatus, Role};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: bad interval, missing field, unusable resource.
    Validation(String),
    LimitExceeded(&'static str),
    Forbidden {
        actor: Ulid,
        role: Role,
        action: &'static str,
    },
    /// The requested interval overlaps this booking on the same vehicle.
    Conflict(Ulid),
    InvalidTransition {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    AlreadyExists(Ulid),
    NotFound(Ulid),
    WalError(String),
}

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Permission,
    Conflict,
    NotFound,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Forbidden { .. } => ErrorKind::Permission,
            EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyExists(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    /// PostgreSQL SQLSTATE reported over the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Forbidden { .. } => "42501",
            EngineError::Conflict(_) => "23P01",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::NotFound(_) => "P0002",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Forbidden { actor, role, action } => {
                write!(f, "{} {actor} may not {action}", role.as_str())
            }
            EngineError::Conflict(id) => write!(f, "vehicle already booked by {id} in that interval"),
            EngineError::InvalidTransition { id, status, action } => {
                write!(f, "cannot {action} booking {id}: status is {status}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
