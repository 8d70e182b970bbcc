use thiserror::Error;

/// Errors surfaced synchronously to callers of the registry, dispatcher
/// and component-instance manager.
///
/// A few kinds named in the design (hook failures, listener failures,
/// user-callback failures) are never returned from a public function —
/// they are logged at the point of capture and swallowed, per the
/// isolation policy: one failing listener or hook must never prevent
/// delivery to the next one.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("invalid LDAP filter: {0}")]
    BadFilter(String),

    #[error("unknown service reference: {0}")]
    UnknownService(u64),

    #[error("service registration missing mandatory property: {0}")]
    MandatoryMissing(String),

    #[error("temporal dependency timed out after {0:?}")]
    TemporalTimeout(std::time::Duration),

    #[error("component callback failed: {0}")]
    ComponentCallbackFailure(String),

    #[error("handler factory not found for id: {0}")]
    UnknownHandlerFactory(String),

    #[error("component instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("component instance not found: {0}")]
    UnknownInstance(String),

    #[error("bundle is not active: {0}")]
    BundleNotActive(u64),

    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
