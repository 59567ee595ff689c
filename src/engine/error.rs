use uuid::Uuid;

use crate::model::{Constraint, OperationalIntent};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Uuid),
    AlreadyExists(Uuid),
    /// Supplied OVN or version does not match the stored entity.
    VersionMismatch {
        id: Uuid,
        supplied: String,
    },
    /// Entity is managed by a different USS.
    PermissionDenied(Uuid),
    BadRequest(String),
    /// Subscription still has operational intents attached to it.
    DependentIntents {
        subscription_id: Uuid,
        dependents: Vec<Uuid>,
    },
    /// The supplied key is missing OVNs of entities overlapping the extent.
    /// Foreign OVNs in the carried references are masked.
    AirspaceConflict {
        missing_operational_intents: Vec<OperationalIntent>,
        missing_constraints: Vec<Constraint>,
    },
    WalError(String),
}

impl EngineError {
    /// HTTP status the transport layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyExists(_) => 409,
            EngineError::VersionMismatch { .. } => 409,
            EngineError::PermissionDenied(_) => 403,
            EngineError::BadRequest(_) => 400,
            EngineError::DependentIntents { .. } => 400,
            EngineError::AirspaceConflict { .. } => 409,
            EngineError::WalError(_) => 500,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::VersionMismatch { id, supplied } => {
                write!(f, "version mismatch for {id}: supplied {supplied:?}")
            }
            EngineError::PermissionDenied(id) => {
                write!(f, "entity {id} is managed by a different USS")
            }
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::DependentIntents {
                subscription_id,
                dependents,
            } => write!(
                f,
                "subscription {subscription_id} has {} dependent operational intents",
                dependents.len()
            ),
            EngineError::AirspaceConflict {
                missing_operational_intents,
                missing_constraints,
            } => write!(
                f,
                "missing OVNs: {} operational intents, {} constraints",
                missing_operational_intents.len(),
                missing_constraints.len()
            ),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_api_contract() {
        let id = Uuid::new_v4();
        assert_eq!(EngineError::NotFound(id).http_status(), 404);
        assert_eq!(EngineError::AlreadyExists(id).http_status(), 409);
        assert_eq!(
            EngineError::VersionMismatch {
                id,
                supplied: "v1".into()
            }
            .http_status(),
            409
        );
        assert_eq!(EngineError::PermissionDenied(id).http_status(), 403);
        assert_eq!(EngineError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(
            EngineError::DependentIntents {
                subscription_id: id,
                dependents: vec![id]
            }
            .http_status(),
            400
        );
        assert_eq!(
            EngineError::AirspaceConflict {
                missing_operational_intents: vec![],
                missing_constraints: vec![]
            }
            .http_status(),
            409
        );
        assert_eq!(EngineError::WalError("io".into()).http_status(), 500);
    }
}
