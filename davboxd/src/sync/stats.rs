use std::collections::HashMap;

use davbox_core::ResultCode;

/// A pass stops contacting the server once more folders than this have
/// failed.
pub const MAX_FAILED_FOLDERS: u32 = 3;

/// Accumulators for one full-account pass. Reset at pass start, read
/// at pass end, then discarded.
#[derive(Debug, Clone, Default)]
pub struct SyncStatistics {
    pub failed_folders: u32,
    pub conflicts: u32,
    pub favourite_failures: u32,
    /// Remote path -> stray local path of files whose recorded copy
    /// lies outside the managed storage area.
    pub forgotten_files: HashMap<String, String>,
    pub last_failed: Option<ResultCode>,
    pub auth_errors: u32,
    pub io_errors: u32,
    pub parse_errors: u32,
}

impl SyncStatistics {
    pub fn record_failure(&mut self, code: ResultCode) {
        self.failed_folders += 1;
        self.last_failed = Some(code);
        match code {
            ResultCode::Unauthorized => self.auth_errors += 1,
            ResultCode::Timeout
            | ResultCode::HostNotAvailable
            | ResultCode::WrongConnection
            | ResultCode::ServiceUnavailable => self.io_errors += 1,
            ResultCode::UnknownError => self.parse_errors += 1,
            _ => {}
        }
    }

    pub fn has_too_many_failures(&self) -> bool {
        self.failed_folders > MAX_FAILED_FOLDERS
    }

    pub fn hit_account_fatal_failure(&self) -> bool {
        self.last_failed.is_some_and(ResultCode::is_account_fatal)
    }

    pub fn has_failures(&self) -> bool {
        self.failed_folders > 0
    }

    pub fn needs_credentials_refresh(&self) -> bool {
        self.auth_errors > 0
    }
}
