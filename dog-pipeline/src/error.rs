use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Infrastructure errors for pipeline operations
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid lease token")]
    InvalidLeaseToken,

    #[error("Lease has expired")]
    LeaseExpired,

    #[error("Job has been canceled")]
    JobCanceled,

    #[error("Job is already in terminal state")]
    JobAlreadyTerminal,

    #[error("Job execution failed: {0}")]
    JobFailed(#[from] JobError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Pipeline shutdown")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::QueueNotFound(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("{0}")]
    Transient(String),

    /// Terminal error - fail immediately, bypassing remaining attempts
    #[error("{0}")]
    Terminal(String),

    /// The job observed its cancellation flag at a checkpoint
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Create a retryable error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Terminal(msg) => msg,
            Self::Cancelled => "job cancelled",
        }
    }
}

/// Failure of a single cache tier. Never leaves the cache manager.
#[derive(Error, Debug, Clone)]
pub enum CacheTierError {
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),

    #[error("distributed cache command failed: {0}")]
    Command(String),

    #[error("cached value could not be decoded: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CacheTierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheTierError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Connection-level stream failure. Triggers client reconnection, never job failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamTransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection lost")]
    Disconnected,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("server rejected subscription: {0}")]
    Rejected(String),

    /// The job does not exist or was purged; reconnecting cannot help
    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl From<PipelineError> for StreamTransportError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::JobNotFound(job_id) => Self::JobNotFound(job_id),
            other => Self::Rejected(other.to_string()),
        }
    }
}

impl StreamTransportError {
    /// Whether the subscription can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::JobNotFound(_))
    }
}
