use thiserror::Error;

/// Errors that can occur while enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job arguments could not be serialized to JSON.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The insert failed at the database level.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Errors surfaced by the [`JobClient`](crate::JobClient).
#[derive(Debug, Error)]
pub enum JobsError {
    /// The job system is disabled, so nothing can be enqueued.
    ///
    /// Callers treat this as "skip the optional side effect", never as a
    /// reason to fail the request that triggered it.
    #[error("job client not initialized")]
    NotInitialized,

    /// Opening the connection pool failed.
    #[error("failed to connect to the job database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Running the queue schema migrations failed.
    #[error("failed to migrate the job schema: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Enqueueing failed.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Errors from a file storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage key would escape the storage root.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Backend specific failure (remote object stores).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors from a mail transport.
#[derive(Debug, Error)]
pub enum MailError {
    /// The message is missing something required for delivery.
    #[error("invalid email: {0}")]
    Invalid(String),

    /// The transport rejected or failed to deliver the message.
    #[error("email transport error: {0}")]
    Transport(String),
}

/// Errors raised while producing a data export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The export record does not exist.
    #[error("data export {0} not found")]
    NotFound(i64),

    /// The user whose data is being exported does not exist.
    #[error("user {0} not found")]
    UserNotFound(i64),

    /// Querying the user's data failed.
    #[error("failed to query user data: {0}")]
    Database(#[from] sqlx::Error),

    /// Building the JSON document failed.
    #[error("failed to serialize user data: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Building the zip archive failed.
    #[error("failed to build export archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Writing the archive to storage failed.
    #[error("failed to store export archive: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        Self::Archive(zip::result::ZipError::Io(error))
    }
}
