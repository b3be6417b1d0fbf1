use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Error taxonomy for the auto-sync core.
///
/// Only `Fatal` and `UserCancelled` are meant to surface past a single
/// `SyncManager`/`FolderSyncState` call; everything else is handled inline by
/// the component that produced it (see each variant's doc comment for the
/// handling policy).
#[derive(Error, Debug)]
pub enum SyncError {
    /// Timeout or connection reset from `ProtocolEngine`. Retried up to
    /// `groupRetryCount` times; on exhaustion the folder is deferred to the
    /// next idle cycle.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Server NO/BAD response. Not retried; any associated offline operation
    /// is dropped and the next operation/folder proceeds.
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// SELECT reported a UID-validity that does not match the local replica.
    /// The folder's database is reset and outstanding offline ops for it are
    /// dropped; a full resync is scheduled.
    #[error("UID validity changed for {folder}: local {local}, server {server}")]
    UidValidityChanged {
        folder: String,
        local: u32,
        server: u32,
    },

    /// The folder's offline-store semaphore is already held. Not a failure;
    /// the caller postpones and retries later.
    #[error("folder busy: {0}")]
    FolderBusy(String),

    /// Sentinel, not an error: `DownloadMessagesForOffline` found nothing to
    /// fetch. Treated as "remove from PriorityQueue, set CompletedIdle", not
    /// reported to listeners as an error.
    #[error("no messages to download")]
    NoMessagesToDownload,

    /// The user cancelled, paused, or stopped mid-chain. The current chain is
    /// aborted; queues are left untouched; not reported as an error.
    #[error("operation cancelled")]
    UserCancelled,

    /// Local I/O failure on the offline store, or an invariant violation.
    /// Surfaces to the URL listener with a fatal code; state does not
    /// advance.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Fatal(e.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Fatal(e.to_string())
    }
}

impl SyncError {
    /// `true` for the handful of variants that should retry up to the
    /// configured `groupRetryCount`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}
