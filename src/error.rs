use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Coarse classification of a [`SyncError`], carried over the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Chunking,
    Integrity,
    Transport,
    Storage,
    NotFound,
    Conflict,
    Protocol,
    Internal,
}

/// Error payload returned by the server for a failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    /// The file id for `NotFound` and `Conflict`, a human readable message otherwise.
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to read source file {path:?}")]
    SourceIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("content-defined chunking failed")]
    Chunking(#[from] fastcdc::v2020::Error),
    #[error("invalid chunker configuration: {0}")]
    Config(String),

    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("no recipe stored for {0:?}")]
    NotFound(String),
    #[error("recipe for {0:?} was replaced concurrently")]
    Conflict(String),
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("storage failure")]
    Storage(#[source] StoreError),
    #[error("transport failure")]
    Transport(#[from] reqwest::Error),
    #[error("i/o failure")]
    Io(#[from] io::Error),
    #[error("malformed message")]
    Codec(#[from] postcard::Error),
    #[error("remote {kind:?} error: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { file_id, .. } => Self::Conflict(file_id),
            err => Self::Storage(err),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceIo { .. } | Self::Chunking(_) => ErrorKind::Chunking,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Protocol(_) | Self::Codec(_) => ErrorKind::Protocol,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Config(_) => ErrorKind::Internal,
            Self::Remote { kind, .. } => *kind,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let detail = match self {
            Self::NotFound(detail)
            | Self::Conflict(detail)
            | Self::Integrity(detail)
            | Self::Protocol(detail) => detail.clone(),
            Self::Remote { message, .. } => message.clone(),
            err => error_chain(err),
        };
        ErrorResponse {
            kind: self.kind(),
            detail,
        }
    }

    /// Rebuilds the error a server reported, so callers can match on the same variants
    /// regardless of transport.
    pub fn from_remote(response: ErrorResponse) -> Self {
        let ErrorResponse { kind, detail } = response;
        match kind {
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::Conflict => Self::Conflict(detail),
            ErrorKind::Integrity => Self::Integrity(detail),
            ErrorKind::Protocol => Self::Protocol(detail),
            kind => Self::Remote {
                kind,
                message: detail,
            },
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}
