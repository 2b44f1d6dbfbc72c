use thiserror::Error;

/// Broad classification of a failure, used to pick the response status and
/// to tell operators whether manual reconciliation may be needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller-fixable; never retried by the controller.
    Client,
    /// An external system failed before any durable state was changed.
    Infrastructure,
    /// One of two coupled systems succeeded and the other did not.
    PartialFailure,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Content-Type must be {expected}")]
    UnsupportedMediaType { expected: &'static str },

    #[error("Invalid image archive: {0}")]
    InvalidArchive(String),

    #[error("Image archive exceeds the upload limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("{0}")]
    Infrastructure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(
        "Infrastructure for deployment '{name}' was provisioned but recording it failed \
         (manual reconciliation may be needed): {reason}"
    )]
    ProvisionedButNotRecorded { name: String, reason: String },

    #[error(
        "Cloud Run resources for deployment '{name}' were destroyed but deleting the \
         database record failed: {reason}"
    )]
    DestroyedButNotRemoved { name: String, reason: String },

    #[error("Image {fqin} was pushed to the registry but recording it failed: {reason}")]
    PushedButNotRecorded { fqin: String, reason: String },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidRequest(_)
            | Error::NotFound(_)
            | Error::UnsupportedMediaType { .. }
            | Error::InvalidArchive(_)
            | Error::PayloadTooLarge { .. } => ErrorClass::Client,
            Error::Infrastructure(_) | Error::Storage(_) => ErrorClass::Infrastructure,
            Error::ProvisionedButNotRecorded { .. }
            | Error::DestroyedButNotRemoved { .. }
            | Error::PushedButNotRecorded { .. } => ErrorClass::PartialFailure,
        }
    }

    /// Wrap a collaborator failure, keeping its whole context chain in the message.
    pub fn infrastructure(action: &str, err: impl std::fmt::Display) -> Self {
        Error::Infrastructure(format!("{}: {}", action, err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
