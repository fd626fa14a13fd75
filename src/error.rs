use std::{fmt, io};

use log::Level;

use crate::types::{AbsoluteFilePath, FileId, RevisionId};

#[derive(Debug)]
pub enum ClientError {
    InputFileError(AbsoluteFilePath),
    RequestError(String),
    UnexpectedResponse(String),
    AlreadyExistResponse(FileId, RevisionId),
    AlreadyExistResponseAndFailToFoundIt(String),
    NotFoundResponse(String),
    DecodingResponseError(String),
    /// HTTP 4xx/5xx surfaced from the remote service.
    BadRequest(u16, String),
    /// Retries in the HTTP layer were exhausted.
    TransientNetwork(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            return Self::TransientNetwork(format!("{:?}", error));
        }
        Self::RequestError(format!("Error happen when make request : {:?}", error))
    }
}

impl From<Error> for ClientError {
    fn from(error: Error) -> Self {
        Self::RequestError(format!("Error happen when make request : {:?}", error))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ClientError::InputFileError(absolute_file_path) => {
                format!("Error when reading input file '{}'", absolute_file_path)
            }
            ClientError::RequestError(message) => {
                format!("Error when making request : {}", message)
            }
            ClientError::UnexpectedResponse(message) => {
                format!("UnExpected response : {}", message)
            }
            ClientError::AlreadyExistResponse(file_id, revision_id) => {
                format!("Content already exist : {}({})", file_id, revision_id)
            }
            ClientError::AlreadyExistResponseAndFailToFoundIt(message) => format!(
                "Already exist but fail to found remote content : {}",
                message
            ),
            ClientError::NotFoundResponse(message) => format!("Not found : {}", message),
            ClientError::DecodingResponseError(message) => format!("Decoding error : {}", message),
            ClientError::BadRequest(status, message) => {
                format!("Remote service returned {} : {}", status, message)
            }
            ClientError::TransientNetwork(message) => {
                format!("Transient network error : {}", message)
            }
        };
        write!(f, "{}", message)
    }
}

/// Error kinds produced by the reconciliation core.
///
/// None of these are meant to panic the process: every call site either
/// recovers per-item (log and skip) or turns the error into a user
/// notification.
#[derive(Debug)]
pub enum Error {
    FailToCreateContentOnRemote(String),
    FailToCreateContentOnLocal(String),
    UnIndexedRelativePath(String),
    UnexpectedError(String),
    PathCastingError(String),
    PathManipulationError(String),
    /// A path resolves under no synced Node. Logged at warning
    /// level by callers, never propagated as a hard failure.
    NodeNotFound(String),
    /// A database commit failed; the surrounding scope has already been
    /// rolled back by the caller.
    DatabaseCommitFailed(String),
    /// Local filesystem IO failure encountered while executing an
    /// Operation (as opposed to during sha256 collection, where IO
    /// failures are treated as "hash unavailable").
    LocalIoFailed(String),
    Client(ClientError),
}

impl Error {
    /// Log level the Operation Queue worker should use when reporting this
    /// error: `NodeNotFound` logs a warning, everything else is an
    /// error-level notification.
    pub fn level(&self) -> Level {
        match self {
            Error::NodeNotFound(_) => Level::Warn,
            _ => Level::Error,
        }
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::BadRequest(status, message) => {
                Error::Client(ClientError::BadRequest(status, message))
            }
            ClientError::TransientNetwork(message) => {
                Error::Client(ClientError::TransientNetwork(message))
            }
            other => Error::UnexpectedError(format!("{:?}", other)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::LocalIoFailed(format!("{:?}", error))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::UnexpectedError("Query returned no rows".to_string())
            }
            other => Error::DatabaseCommitFailed(format!("{:?}", other)),
        }
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(error: std::time::SystemTimeError) -> Self {
        Error::UnexpectedError(format!("{:?}", error))
    }
}

impl From<std::path::StripPrefixError> for Error {
    fn from(error: std::path::StripPrefixError) -> Self {
        Error::PathManipulationError(format!("Unable to strip prefix {:?}", error))
    }
}

impl From<notify::Error> for Error {
    fn from(error: notify::Error) -> Self {
        Error::UnexpectedError(format!("Notify error {:?}", error))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}
