//! Error types for downstream-core

use thiserror::Error;

use crate::build::BuildStatus;

/// Errors returned by a [`BuildClient`](crate::client::BuildClient) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The requested repository or build does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Errors that can occur while triggering downstream builds
#[derive(Error, Debug)]
pub enum DownstreamError {
    /// Invalid or missing configuration, detected before any network call
    #[error("configuration error: {0}")]
    Config(String),

    /// Repository reference is not `owner/name[@branch[@environment]]`
    #[error("unable to parse repository name {0:?}")]
    ReferenceParse(String),

    /// Parameter token is neither `KEY=VALUE` nor an existing file
    #[error("invalid param '{0}'; must be KEY=VALUE or file path")]
    InvalidParam(String),

    /// Parameter file exists but could not be read
    #[error("unable to read params file {path}: {reason}")]
    ParamFile { path: String, reason: String },

    /// A `params_from_env` name is not present in the environment
    #[error("param_from_env '{0}' is not set")]
    MissingEnvParam(String),

    /// A `params_from_env` variable is set but is not valid UTF-8
    #[error("param_from_env '{0}' is not valid unicode")]
    NonUnicodeEnvParam(String),

    /// No passing build exists on the requested branch
    #[error("unable to get last successful build for {0}")]
    NoSuccessfulBuild(String),

    /// Looking up the build to act on failed
    #[error("unable to resolve build for {entry}: {source}")]
    Resolve {
        entry: String,
        #[source]
        source: ClientError,
    },

    /// The trigger call failed
    #[error("unable to trigger {action} for {entry}: {source}")]
    Dispatch {
        entry: String,
        action: &'static str,
        #[source]
        source: ClientError,
    },

    /// The triggered build finished without succeeding
    #[error("build {number} did not succeed: {status}")]
    BuildFailed { number: i64, status: BuildStatus },

    /// Polling the triggered build failed
    #[error("unable to get status of build {number}: {source}")]
    BlockPoll {
        number: i64,
        #[source]
        source: ClientError,
    },
}

impl DownstreamError {
    /// Whether a waiting poll loop may retry after this error.
    ///
    /// Configuration and parse errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownstreamError::NoSuccessfulBuild(_)
                | DownstreamError::Resolve { .. }
                | DownstreamError::Dispatch { .. }
        )
    }

    /// Whether this error was raised before any network call.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            DownstreamError::Config(_)
                | DownstreamError::InvalidParam(_)
                | DownstreamError::ParamFile { .. }
                | DownstreamError::MissingEnvParam(_)
                | DownstreamError::NonUnicodeEnvParam(_)
        )
    }
}
