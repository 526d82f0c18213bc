use thiserror::Error;

use crate::aggregate::ErrorAggregate;
use crate::document::FieldError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// A prerequisite of a feature is not satisfied; nothing was applied
    #[error("Validation Error: {0}")]
    ValidationError(String),

    /// A single create, update or delete call failed
    #[error("failed to {action} {kind} `{name}`: {source}")]
    ApplyError {
        action: &'static str,
        kind: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Aggregate(ErrorAggregate),

    /// The object changed since it was read
    #[error("Conflict Error: {0}")]
    ConflictError(String),

    #[error("Document Error: {0}")]
    DocumentError(#[source] FieldError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            Error::ApplyError { source, .. } => source.api_code(),
            _ => None,
        }
    }
}

pub mod aggregate;
pub mod conditions;
pub mod config;
pub mod config_merge;
pub mod crd;
pub mod document;
pub mod events_helper;
pub mod features;
pub mod manifests;
pub mod ownership;
pub mod search_controller;
pub mod store;
pub mod sync;

/// Log and trace integrations
pub mod telemetry;
