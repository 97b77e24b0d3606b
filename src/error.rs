//! Error handling for the Slurm connector.

use thiserror::Error;

/// Result type for connector operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors that can occur while translating and submitting jobs.
///
/// The HTTP front door maps these onto response classes via
/// [`AdapterError::http_status`]: validation failures are 400s and are
/// always detected before any remote command is issued; transport and
/// submission failures are 500s.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The SSH channel to the cluster could not be opened, authenticated
    /// or executed on.
    #[error("transport error: {0}")]
    Transport(String),

    /// A required key was absent from the job script.
    #[error("missing required job field: {0}")]
    MissingField(&'static str),

    /// A job field that must be numeric was not.
    #[error("field {field} is not an integer: {value}")]
    BadInteger { field: &'static str, value: String },

    /// Appdef V2+ is required for this downstream.
    #[error("Appdef V2+ is required for this downstream (got v{0})")]
    UnsupportedAppdef(i64),

    /// Interactive job requested but the cluster has no jobs domain.
    #[error("interactive jobs are not supported on this cluster")]
    InteractiveUnsupported,

    /// The submission carried no script for the configured executor.
    #[error("no executor script for '{0}' in submission")]
    MissingExecutorScript(String),

    /// The decoded executor script was not valid UTF-8.
    #[error("executor script is not valid UTF-8")]
    ScriptNotUtf8,

    /// The submitting user has no local account mapping.
    #[error("no local user mapping for {0}")]
    UnmappedUser(String),

    /// Pseudo-device token without a `key=value` shape.
    #[error("malformed (pseudo)device: {0}")]
    MalformedDevice(String),

    /// Pseudo-device key outside the recognized set.
    #[error("unknown (pseudo)device specified: {0}")]
    UnknownDevice(String),

    /// Overlay pseudo-device with a non-integer or negative value.
    #[error("invalid overlay setting {0}: must be integer >= 0")]
    InvalidOverlay(String),

    /// Sub-request path did not decode to `{name}/{number}/{id}/{method}`.
    #[error("malformed request path: {0}")]
    BadRequestPath(String),

    /// slurmrestd rejected the submission or returned garbage.
    #[error("submit(): {0}")]
    Submit(String),

    /// Job state or elapsed time in a shape we cannot translate.
    #[error("unrecognized elapsed time format: {0}")]
    ElapsedFormat(String),

    /// Configuration error (environment or users-mapping file).
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error in a job descriptor field.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl AdapterError {
    /// Whether this error is the caller's fault (malformed descriptor).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AdapterError::MissingField(_)
                | AdapterError::BadInteger { .. }
                | AdapterError::UnsupportedAppdef(_)
                | AdapterError::InteractiveUnsupported
                | AdapterError::MissingExecutorScript(_)
                | AdapterError::ScriptNotUtf8
                | AdapterError::UnmappedUser(_)
                | AdapterError::MalformedDevice(_)
                | AdapterError::UnknownDevice(_)
                | AdapterError::InvalidOverlay(_)
                | AdapterError::BadRequestPath(_)
                | AdapterError::Base64(_)
        )
    }

    /// HTTP status class for the front door.
    pub fn http_status(&self) -> u16 {
        if self.is_validation() { 400 } else { 500 }
    }
}
