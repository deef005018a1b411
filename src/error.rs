//! Shared error-kind hierarchy.
//!
//! Each module defines its own `thiserror` enum for the failures specific to
//! its boundary; `CoreError` composes them for callers (the axum handlers,
//! the agent loop) that need one error type to log and respond with.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Link(#[from] crate::link::LinkError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Instance(#[from] crate::instances::InstanceError),

    #[error(transparent)]
    Claims(#[from] crate::claims::ClaimsError),

    #[error(transparent)]
    Hostname(#[from] crate::hostname::HostnameError),

    #[error(transparent)]
    Loader(#[from] crate::loader::LoaderError),

    #[error(transparent)]
    Limiter(#[from] crate::ratelimit::LimiterError),
}
