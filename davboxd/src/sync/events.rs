use davbox_core::ResultCode;

/// Broadcast notifications about sync progress. Observers subscribe to
/// the daemon's broadcast channel; lagging receivers only lose events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started {
        account: String,
    },
    Finished {
        account: String,
        success: bool,
    },
    FolderQueued {
        account: String,
        path: String,
    },
    /// Sent after every folder attempt, success or failure.
    FolderContentsSynced {
        account: String,
        path: String,
        code: ResultCode,
    },
}
