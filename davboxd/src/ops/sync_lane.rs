use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use davbox_core::{RemoteOperationResult, SessionManager};

use super::forest::{ForestKey, IndexedForest, is_descendant_path};
use super::request::Target;
use crate::storage::FileStore;
use crate::sync::events::SyncEvent;
use crate::sync::folder::SynchronizeFolderOperation;

type PendingSync = (Target, Arc<SynchronizeFolderOperation>);

struct PendingState {
    forest: IndexedForest<PendingSync>,
    order: VecDeque<ForestKey>,
    current: Option<(ForestKey, Arc<SynchronizeFolderOperation>)>,
}

struct Shared {
    pending: Mutex<PendingState>,
    notify: Notify,
}

/// Folder-sync lane: one worker draining folder syncs in the order
/// their keys first entered the forest. A folder stays in the forest
/// while it executes, so pending queries keep seeing it.
pub struct SyncFolderLane {
    shared: Arc<Shared>,
    events: broadcast::Sender<SyncEvent>,
    worker: JoinHandle<()>,
}

impl SyncFolderLane {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn FileStore>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingState {
                forest: IndexedForest::default(),
                order: VecDeque::new(),
                current: None,
            }),
            notify: Notify::new(),
        });
        let worker = tokio::spawn(worker_loop(
            shared.clone(),
            sessions,
            store,
            events.clone(),
        ));
        Self {
            shared,
            events,
            worker,
        }
    }

    /// Queues a folder sync unless one is already pending for the same
    /// (owner, path). Only a first insertion announces the new sync;
    /// duplicates keep the original queue position.
    pub fn add(&self, target: Target, path: &str, push_only: bool) -> bool {
        let owner = target.owner().to_string();
        let operation = Arc::new(SynchronizeFolderOperation::new(&owner, path, push_only));
        let inserted = {
            let mut pending = self.shared.pending.lock().unwrap();
            let inserted = pending.forest.try_insert(&owner, path, (target, operation));
            if inserted {
                pending.order.push_back(ForestKey::new(&owner, path));
            }
            inserted
        };
        if inserted {
            debug!(%owner, path, "queued folder sync");
            let _ = self.events.send(SyncEvent::FolderQueued {
                account: owner,
                path: path.to_string(),
            });
            self.shared.notify.notify_one();
        }
        inserted
    }

    /// Cancels a pending sync outright; a running sync whose path is
    /// at or under `path` is asked to stop at its next check.
    pub fn cancel(&self, owner: &str, path: &str) {
        let mut pending = self.shared.pending.lock().unwrap();
        if let Some(removed) = pending.forest.remove(owner, path) {
            debug!(owner, path, "cancelled pending folder sync");
            removed.payload.1.cancel();
            return;
        }
        if let Some((key, operation)) = &pending.current
            && key.owner == owner
            && is_descendant_path(&key.path, path)
        {
            debug!(owner, path, "cancelling running folder sync");
            operation.cancel();
        }
    }

    /// True when `path` or anything under it is queued or running.
    pub fn is_synchronizing(&self, owner: &str, path: &str) -> bool {
        let pending = self.shared.pending.lock().unwrap();
        pending.forest.contains_descendant(owner, path)
            || pending
                .current
                .as_ref()
                .is_some_and(|(key, _)| key.owner == owner && is_descendant_path(&key.path, path))
    }

    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    sessions: Arc<SessionManager>,
    store: Arc<dyn FileStore>,
    events: broadcast::Sender<SyncEvent>,
) {
    loop {
        let notified = shared.notify.notified();
        let next = {
            let mut pending = shared.pending.lock().unwrap();
            loop {
                let Some(key) = pending.order.pop_front() else {
                    break None;
                };
                // Keys whose entry was cancelled while pending are
                // stale; skip them silently.
                if let Some((target, operation)) =
                    pending.forest.get(&key.owner, &key.path).cloned()
                {
                    pending.current = Some((key.clone(), operation.clone()));
                    break Some((key, target, operation));
                }
            }
        };
        let Some((key, target, operation)) = next else {
            notified.await;
            continue;
        };

        // Credentials may have rotated since the sync was queued; the
        // session manager hands back a refreshed client every time.
        let result = match sessions.client_for(&target.account_spec()) {
            Ok(client) => operation.execute(&client, store.as_ref()).await,
            Err(error) => {
                warn!(%error, "could not build client for folder sync");
                RemoteOperationResult::from_transport_error(&error)
            }
        };

        {
            let mut pending = shared.pending.lock().unwrap();
            pending.forest.remove(&key.owner, &key.path);
            pending.current = None;
        }
        let _ = events.send(SyncEvent::FolderContentsSynced {
            account: key.owner,
            path: key.path,
            code: result.code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use davbox_core::{Credentials, ResultCode};
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target_for(server: &MockServer) -> Target {
        Target {
            account: Some("alice".into()),
            base_url: Url::parse(&server.uri()).unwrap(),
            credentials: Credentials::basic("alice", "secret"),
        }
    }

    fn make_lane(events: broadcast::Sender<SyncEvent>) -> SyncFolderLane {
        SyncFolderLane::new(
            Arc::new(SessionManager::new("davbox-test")),
            Arc::new(MemoryStore::new("/var/lib/davbox")),
            events,
        )
    }

    #[tokio::test]
    async fn duplicate_adds_keep_the_first_request() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;

        let (events, mut rx) = broadcast::channel(16);
        let lane = make_lane(events);

        assert!(lane.add(target_for(&server), "/Docs", false));
        assert!(!lane.add(target_for(&server), "/Docs", false));

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::FolderQueued {
                account: "alice".into(),
                path: "/Docs".into(),
            }
        );
        // Exactly one terminal event follows; the duplicate queued
        // nothing.
        let synced = rx.recv().await.unwrap();
        assert!(matches!(
            synced,
            SyncEvent::FolderContentsSynced { ref path, .. } if path == "/Docs"
        ));
        assert!(rx.try_recv().is_err());
        lane.shutdown();
    }

    #[tokio::test]
    async fn cancelled_pending_sync_never_runs() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(url_path("/remote.php/dav/files/alice/a"))
            .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PROPFIND"))
            .and(url_path("/remote.php/dav/files/alice/b"))
            .respond_with(ResponseTemplate::new(404))
            .expect(0)
            .mount(&server)
            .await;

        let (events, mut rx) = broadcast::channel(16);
        let lane = make_lane(events);

        lane.add(target_for(&server), "/a", false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        lane.add(target_for(&server), "/b", false);
        lane.cancel("alice", "/b");
        assert!(!lane.is_synchronizing("alice", "/b"));

        let mut synced_paths = Vec::new();
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        {
            if let Ok(SyncEvent::FolderContentsSynced { path, .. }) = event {
                synced_paths.push(path);
            }
        }
        assert_eq!(synced_paths, vec!["/a".to_string()]);
        lane.shutdown();
    }

    #[tokio::test]
    async fn is_synchronizing_sees_queued_descendants() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let (events, _rx) = broadcast::channel(16);
        let lane = make_lane(events);
        lane.add(target_for(&server), "/Docs/sub", false);

        assert!(lane.is_synchronizing("alice", "/Docs/sub"));
        assert!(lane.is_synchronizing("alice", "/Docs"));
        assert!(!lane.is_synchronizing("alice", "/Doc"));
        assert!(!lane.is_synchronizing("bob", "/Docs"));
        lane.shutdown();
    }

    #[tokio::test]
    async fn failed_syncs_still_emit_a_terminal_event() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (events, mut rx) = broadcast::channel(16);
        let lane = make_lane(events);
        lane.add(target_for(&server), "/Docs", false);

        loop {
            if let SyncEvent::FolderContentsSynced { code, .. } = rx.recv().await.unwrap() {
                assert_eq!(code, ResultCode::ServiceUnavailable);
                break;
            }
        }
        lane.shutdown();
    }
}
