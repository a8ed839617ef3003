use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, warn};

use davbox_core::{AccountSpec, RemoteOperationResult, ResultCode, SessionManager};

use super::events::SyncEvent;
use super::folder::SynchronizeFolderOperation;
use super::stats::SyncStatistics;
use crate::storage::FileStore;

/// What one folder visit produced, flattened for the pass accounting.
#[derive(Debug, Clone)]
pub struct FolderOutcome {
    pub result: RemoteOperationResult,
    pub conflicts: u32,
    pub favourite_failures: u32,
    pub forgotten_files: HashMap<String, String>,
    /// Child folder paths, flagged with whether the server reports
    /// them changed.
    pub folders_to_visit: Vec<(String, bool)>,
}

impl FolderOutcome {
    pub fn from_result(result: RemoteOperationResult) -> Self {
        Self {
            result,
            conflicts: 0,
            favourite_failures: 0,
            forgotten_files: HashMap::new(),
            folders_to_visit: Vec::new(),
        }
    }
}

/// Seam between the pass orchestration and the folder engine, so the
/// skip/abort policy can be exercised without a server.
#[async_trait]
pub trait FolderSyncer: Send + Sync {
    async fn sync_folder(&self, path: &str, push_only: bool) -> FolderOutcome;
}

/// Production syncer: one `SynchronizeFolderOperation` per folder,
/// with a freshly resolved client for every visit.
pub struct RemoteFolderSyncer {
    sessions: Arc<SessionManager>,
    account: AccountSpec,
    store: Arc<dyn FileStore>,
}

impl RemoteFolderSyncer {
    pub fn new(
        sessions: Arc<SessionManager>,
        account: AccountSpec,
        store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            sessions,
            account,
            store,
        }
    }
}

#[async_trait]
impl FolderSyncer for RemoteFolderSyncer {
    async fn sync_folder(&self, path: &str, push_only: bool) -> FolderOutcome {
        let client = match self.sessions.client_for(&self.account) {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, "could not build client for account pass");
                return FolderOutcome::from_result(RemoteOperationResult::from_transport_error(
                    &error,
                ));
            }
        };
        let operation = SynchronizeFolderOperation::new(self.account.user_id(), path, push_only);
        let result = operation.execute(&client, self.store.as_ref()).await;
        let output = operation.output();
        FolderOutcome {
            result,
            conflicts: output.conflicts_found,
            favourite_failures: output.favourite_failures,
            forgotten_files: output.forgotten_files,
            folders_to_visit: output
                .folders_to_visit
                .into_iter()
                .map(|(child, changed)| (child.remote_path, changed))
                .collect(),
        }
    }
}

/// User-visible notifications raised at the end of a pass. The daemon
/// ships a logging implementation; a desktop frontend plugs in here.
pub trait Notifier: Send + Sync {
    fn sync_failed(&self, account: &str, needs_credentials_refresh: bool);
    fn conflicts_detected(&self, account: &str, count: u32);
    fn forgotten_files_detected(&self, account: &str, files: &HashMap<String, String>);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn sync_failed(&self, account: &str, needs_credentials_refresh: bool) {
        warn!(account, needs_credentials_refresh, "account sync failed");
    }

    fn conflicts_detected(&self, account: &str, count: u32) {
        warn!(account, count, "conflicts detected during sync");
    }

    fn forgotten_files_detected(&self, account: &str, files: &HashMap<String, String>) {
        warn!(account, count = files.len(), "stray local files detected");
    }
}

#[derive(Debug)]
pub struct PassOutcome {
    /// Manual passes with failures are not retried automatically.
    pub do_not_retry: bool,
    pub needs_credentials_refresh: bool,
    pub stats: SyncStatistics,
}

/// One full pass over an account: pre-order traversal from the root,
/// each folder attempted exactly once.
pub struct AccountSyncPass {
    account: String,
    events: broadcast::Sender<SyncEvent>,
    cancelled: Arc<AtomicBool>,
}

impl AccountSyncPass {
    pub fn new(account: impl Into<String>, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            account: account.into(),
            events,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with whoever may cancel the pass; checked at every
    /// folder boundary.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub async fn run(
        &self,
        syncer: &dyn FolderSyncer,
        notifier: &dyn Notifier,
        root_path: &str,
        manual: bool,
    ) -> PassOutcome {
        let mut stats = SyncStatistics::default();
        info!(account = %self.account, manual, "starting account sync pass");
        let _ = self.events.send(SyncEvent::Started {
            account: self.account.clone(),
        });

        self.sync_recursive(syncer, root_path.to_string(), false, &mut stats)
            .await;

        let success = !stats.has_failures() && !self.cancelled.load(Ordering::SeqCst);
        let _ = self.events.send(SyncEvent::Finished {
            account: self.account.clone(),
            success,
        });

        if stats.has_failures() {
            notifier.sync_failed(&self.account, stats.needs_credentials_refresh());
        }
        if stats.conflicts > 0 {
            notifier.conflicts_detected(&self.account, stats.conflicts);
        }
        if !stats.forgotten_files.is_empty() {
            notifier.forgotten_files_detected(&self.account, &stats.forgotten_files);
        }

        PassOutcome {
            do_not_retry: manual && stats.has_failures(),
            needs_credentials_refresh: stats.needs_credentials_refresh(),
            stats,
        }
    }

    fn sync_recursive<'a>(
        &'a self,
        syncer: &'a dyn FolderSyncer,
        path: String,
        push_only: bool,
        stats: &'a mut SyncStatistics,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            // Abort guards run before any server contact.
            if self.cancelled.load(Ordering::SeqCst)
                || stats.has_too_many_failures()
                || stats.hit_account_fatal_failure()
            {
                return;
            }

            let outcome = syncer.sync_folder(&path, push_only).await;
            stats.conflicts += outcome.conflicts;
            stats.favourite_failures += outcome.favourite_failures;
            stats.forgotten_files.extend(outcome.forgotten_files);

            let code = outcome.result.code;
            let _ = self.events.send(SyncEvent::FolderContentsSynced {
                account: self.account.clone(),
                path: path.clone(),
                code,
            });

            match code {
                ResultCode::Ok => {
                    for (child, changed) in outcome.folders_to_visit {
                        self.sync_recursive(syncer, child, !changed, stats).await;
                    }
                }
                // A folder that vanished mid-pass is tolerated.
                ResultCode::FileNotFound => {}
                ResultCode::Cancelled => {}
                failed => stats.record_failure(failed),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedSyncer {
        calls: Mutex<Vec<(String, bool)>>,
        script: HashMap<String, (ResultCode, Vec<(String, bool)>)>,
    }

    impl ScriptedSyncer {
        fn new(script: Vec<(&str, ResultCode, Vec<(&str, bool)>)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                script: script
                    .into_iter()
                    .map(|(path, code, children)| {
                        (
                            path.to_string(),
                            (
                                code,
                                children
                                    .into_iter()
                                    .map(|(child, changed)| (child.to_string(), changed))
                                    .collect(),
                            ),
                        )
                    })
                    .collect(),
            }
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FolderSyncer for ScriptedSyncer {
        async fn sync_folder(&self, path: &str, push_only: bool) -> FolderOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((path.to_string(), push_only));
            let (code, children) = self
                .script
                .get(path)
                .cloned()
                .unwrap_or((ResultCode::Ok, Vec::new()));
            let mut outcome = FolderOutcome::from_result(RemoteOperationResult::from_code(code));
            outcome.folders_to_visit = children;
            outcome
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        failed: Mutex<Vec<(String, bool)>>,
        conflicts: Mutex<Vec<u32>>,
        forgotten: Mutex<Vec<usize>>,
    }

    impl Notifier for RecordingNotifier {
        fn sync_failed(&self, account: &str, needs_credentials_refresh: bool) {
            self.failed
                .lock()
                .unwrap()
                .push((account.to_string(), needs_credentials_refresh));
        }

        fn conflicts_detected(&self, _account: &str, count: u32) {
            self.conflicts.lock().unwrap().push(count);
        }

        fn forgotten_files_detected(&self, _account: &str, files: &HashMap<String, String>) {
            self.forgotten.lock().unwrap().push(files.len());
        }
    }

    fn make_pass() -> (AccountSyncPass, broadcast::Receiver<SyncEvent>) {
        let (events, rx) = broadcast::channel(64);
        (AccountSyncPass::new("alice", events), rx)
    }

    #[tokio::test]
    async fn unchanged_children_are_visited_push_only() {
        let syncer = ScriptedSyncer::new(vec![(
            "/",
            ResultCode::Ok,
            vec![("/changed", true), ("/stable", false)],
        )]);
        let (pass, _rx) = make_pass();
        pass.run(&syncer, &RecordingNotifier::default(), "/", false)
            .await;

        assert_eq!(
            syncer.calls(),
            vec![
                ("/".to_string(), false),
                ("/changed".to_string(), false),
                ("/stable".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn remaining_folders_are_skipped_after_too_many_failures() {
        let syncer = ScriptedSyncer::new(vec![
            (
                "/",
                ResultCode::Ok,
                vec![
                    ("/c1", true),
                    ("/c2", true),
                    ("/c3", true),
                    ("/c4", true),
                    ("/c5", true),
                    ("/c6", true),
                ],
            ),
            ("/c1", ResultCode::Timeout, vec![]),
            ("/c2", ResultCode::Timeout, vec![]),
            ("/c3", ResultCode::Timeout, vec![]),
            ("/c4", ResultCode::Timeout, vec![]),
            ("/c5", ResultCode::Timeout, vec![]),
            ("/c6", ResultCode::Timeout, vec![]),
        ]);
        let (pass, _rx) = make_pass();
        let outcome = pass
            .run(&syncer, &RecordingNotifier::default(), "/", false)
            .await;

        // Four failures trip the guard; the last two children are
        // never attempted.
        let attempted: Vec<String> = syncer.calls().into_iter().map(|(path, _)| path).collect();
        assert_eq!(attempted, vec!["/", "/c1", "/c2", "/c3", "/c4"]);
        assert_eq!(outcome.stats.failed_folders, 4);
    }

    #[tokio::test]
    async fn account_fatal_failure_aborts_the_pass() {
        let syncer = ScriptedSyncer::new(vec![
            (
                "/",
                ResultCode::Ok,
                vec![("/c1", true), ("/c2", true), ("/c3", true)],
            ),
            ("/c1", ResultCode::SslError, vec![]),
        ]);
        let (pass, mut rx) = make_pass();
        let outcome = pass
            .run(&syncer, &RecordingNotifier::default(), "/", false)
            .await;

        let attempted: Vec<String> = syncer.calls().into_iter().map(|(path, _)| path).collect();
        assert_eq!(attempted, vec!["/", "/c1"]);
        assert_eq!(outcome.stats.last_failed, Some(ResultCode::SslError));

        // Start and Finished are broadcast even for aborted passes.
        let mut saw_started = false;
        let mut saw_finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SyncEvent::Started { .. } => saw_started = true,
                SyncEvent::Finished { success, .. } => {
                    saw_finished = true;
                    assert!(!success);
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_finished);
    }

    #[tokio::test]
    async fn vanished_folders_are_not_failures() {
        let syncer = ScriptedSyncer::new(vec![
            ("/", ResultCode::Ok, vec![("/gone", true), ("/ok", true)]),
            ("/gone", ResultCode::FileNotFound, vec![]),
        ]);
        let notifier = RecordingNotifier::default();
        let (pass, _rx) = make_pass();
        let outcome = pass.run(&syncer, &notifier, "/", true).await;

        let attempted: Vec<String> = syncer.calls().into_iter().map(|(path, _)| path).collect();
        assert_eq!(attempted, vec!["/", "/gone", "/ok"]);
        assert_eq!(outcome.stats.failed_folders, 0);
        assert!(!outcome.do_not_retry);
        assert!(notifier.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_pass_with_auth_failures_requests_a_credentials_refresh() {
        let syncer = ScriptedSyncer::new(vec![(
            "/",
            ResultCode::Unauthorized,
            vec![],
        )]);
        let notifier = RecordingNotifier::default();
        let (pass, _rx) = make_pass();
        let outcome = pass.run(&syncer, &notifier, "/", true).await;

        assert!(outcome.do_not_retry);
        assert!(outcome.needs_credentials_refresh);
        assert_eq!(
            notifier.failed.lock().unwrap().as_slice(),
            &[("alice".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_traversal_at_the_next_frame() {
        let syncer = ScriptedSyncer::new(vec![(
            "/",
            ResultCode::Ok,
            vec![("/c1", true), ("/c2", true)],
        )]);
        let (pass, _rx) = make_pass();
        pass.cancellation_handle().store(true, Ordering::SeqCst);
        pass.run(&syncer, &RecordingNotifier::default(), "/", false)
            .await;
        assert!(syncer.calls().is_empty());
    }
}
