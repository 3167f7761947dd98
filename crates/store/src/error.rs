use keel_core::{FieldErrors, Kind};
use keel_kv::{KvError, Revision};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: Kind, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: Kind, name: String },
    #[error("conflict on {kind} {name:?}: {reason}")]
    Conflict { kind: Kind, name: String, reason: String },
    #[error("{kind} {name:?} is invalid: {errors}")]
    Invalid { kind: Kind, name: String, errors: FieldErrors },
    #[error("request canceled")]
    Canceled,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("resource version {requested} is too old (oldest available {oldest}); resync required")]
    TooOldResourceVersion { requested: Revision, oldest: Revision },
    #[error("watch fell behind and was closed; resync required")]
    WatchOverflow,
}

impl StoreError {
    /// HTTP status the REST layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::NotFound { .. } => 404,
            StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => 409,
            StoreError::Invalid { .. } => 422,
            StoreError::Canceled => 499,
            StoreError::Internal(_) => 500,
            StoreError::Unavailable(_) => 503,
            StoreError::TooOldResourceVersion { .. } | StoreError::WatchOverflow => 410,
        }
    }

    /// The caller must discard its view and start again from a fresh List.
    pub fn is_resync_required(&self) -> bool {
        matches!(self, StoreError::TooOldResourceVersion { .. } | StoreError::WatchOverflow)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, StoreError::Invalid { .. })
    }

    pub(crate) fn invalid(kind: Kind, name: &str, errors: impl Into<FieldErrors>) -> Self {
        StoreError::Invalid { kind, name: name.to_string(), errors: errors.into() }
    }
}

impl From<KvError> for StoreError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Unavailable(msg) => StoreError::Unavailable(msg),
            KvError::Compacted { requested, oldest } => StoreError::TooOldResourceVersion { requested, oldest },
            KvError::Overflowed => StoreError::WatchOverflow,
            KvError::Internal(msg) => StoreError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_mapping() {
        let nf = StoreError::NotFound { kind: Kind::Node, name: "n1".into() };
        assert_eq!(nf.status_code(), 404);
        assert_eq!(StoreError::Unavailable("x".into()).status_code(), 503);
        assert_eq!(StoreError::invalid(Kind::Host, "h", FieldErrors::new()).status_code(), 422);
    }

    #[test]
    fn compaction_requires_resync() {
        let e: StoreError = KvError::Compacted { requested: 3, oldest: 10 }.into();
        assert!(e.is_resync_required());
        assert_eq!(e.status_code(), 410);
        let e: StoreError = KvError::Overflowed.into();
        assert!(e.is_resync_required());
        assert!(!StoreError::Canceled.is_resync_required());
    }
}
