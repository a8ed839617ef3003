use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use davbox_core::{DavClient, RemoteEntry, RemoteOperation, RemoteOperationResult, ResultCode};

use crate::storage::{FileStore, LocalFile};

/// Per-visit output of one folder sync, read by the account pass after
/// the operation finishes.
#[derive(Debug, Clone, Default)]
pub struct FolderSyncOutput {
    pub conflicts_found: u32,
    pub favourite_failures: u32,
    /// Remote path -> stray local path of records pointing outside the
    /// managed storage area. The link is severed, the file stays put.
    pub forgotten_files: HashMap<String, String>,
    /// Child folders, each flagged with whether the server reports the
    /// subtree changed since the locally known tree etag.
    pub folders_to_visit: Vec<(LocalFile, bool)>,
}

/// Synchronizes one folder, without recursion. The account pass walks
/// `folders_to_visit`; the sync lane runs single folders on demand.
pub struct SynchronizeFolderOperation {
    owner: String,
    remote_path: String,
    push_only: bool,
    cancelled: AtomicBool,
    output: Mutex<FolderSyncOutput>,
}

impl SynchronizeFolderOperation {
    pub fn new(
        owner: impl Into<String>,
        remote_path: impl Into<String>,
        push_only: bool,
    ) -> Self {
        Self {
            owner: owner.into(),
            remote_path: remote_path.into(),
            push_only,
            cancelled: AtomicBool::new(false),
            output: Mutex::new(FolderSyncOutput::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Requests a cooperative stop. In-flight HTTP completes; the next
    /// step boundary observes the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn output(&self) -> FolderSyncOutput {
        self.output.lock().unwrap().clone()
    }

    pub async fn execute(
        &self,
        client: &DavClient,
        store: &dyn FileStore,
    ) -> RemoteOperationResult {
        if self.is_cancelled() {
            return RemoteOperationResult::cancelled();
        }
        debug!(
            owner = %self.owner,
            path = %self.remote_path,
            push_only = self.push_only,
            "synchronizing folder"
        );

        if self.push_only {
            self.prepare_push(store);
            return RemoteOperationResult::ok();
        }

        let fetch = RemoteOperation::ReadFolder {
            path: self.remote_path.clone(),
        }
        .execute(client)
        .await;

        if !fetch.is_success() {
            if fetch.code == ResultCode::FileNotFound {
                // The folder is gone remotely; drop the local mirror.
                // Callers treat this as tolerable, not as a failure.
                info!(owner = %self.owner, path = %self.remote_path, "remote folder vanished");
                store.remove_folder(&self.owner, &self.remote_path);
            }
            return fetch;
        }

        if self.is_cancelled() {
            return RemoteOperationResult::cancelled();
        }

        let Some(entries) = fetch.entries() else {
            return RemoteOperationResult::from_code(ResultCode::UnknownError);
        };
        match self.merge_remote_folder(entries, store) {
            Ok(()) => RemoteOperationResult::ok(),
            Err(()) => RemoteOperationResult::cancelled(),
        }
    }

    /// Nothing to fetch: list what is already known locally so the
    /// traversal can continue downward, and reconcile files marked for
    /// continuous sync from local knowledge alone.
    fn prepare_push(&self, store: &dyn FileStore) {
        let children = store.folder_content(&self.owner, &self.remote_path);
        let mut output = self.output.lock().unwrap();
        for child in children {
            if child.is_dir {
                output.folders_to_visit.push((child, false));
                continue;
            }
            // A changed favourite whose copy left the managed area has
            // nothing the engine can push.
            if child.keep_in_sync
                && child.changed_locally()
                && let Some(storage_path) = &child.storage_path
                && !store.is_managed(storage_path)
            {
                output.favourite_failures += 1;
            }
        }
    }

    fn merge_remote_folder(&self, entries: &[RemoteEntry], store: &dyn FileStore) -> Result<(), ()> {
        let Some((folder_entry, child_entries)) = entries.split_first() else {
            return Ok(());
        };

        let local_children = store.folder_content(&self.owner, &self.remote_path);
        let by_id: HashMap<&str, &LocalFile> = local_children
            .iter()
            .filter_map(|file| file.remote_id.as_deref().map(|id| (id, file)))
            .collect();
        let by_path: HashMap<&str, &LocalFile> = local_children
            .iter()
            .map(|file| (file.remote_path.as_str(), file))
            .collect();

        let mut updated: Vec<LocalFile> = Vec::with_capacity(child_entries.len());
        let mut output = self.output.lock().unwrap();

        for entry in child_entries {
            if self.is_cancelled() {
                return Err(());
            }
            let known = entry
                .remote_id
                .as_deref()
                .and_then(|id| by_id.get(id).copied())
                .or_else(|| by_path.get(entry.path.as_str()).copied());

            let mut child = local_file_from_entry(entry);
            if let Some(local) = known {
                child.storage_path = local.storage_path.clone();
                child.local_modified = local.local_modified;
                child.last_sync = local.last_sync;
                child.keep_in_sync = local.keep_in_sync;

                if let Some(storage_path) = &local.storage_path
                    && !store.is_managed(storage_path)
                {
                    output
                        .forgotten_files
                        .insert(entry.path.clone(), storage_path.clone());
                    child.storage_path = None;
                    child.local_modified = 0;
                }

                let mut in_conflict = false;
                if !entry.is_dir
                    && local.changed_locally()
                    && entry.etag != local.etag
                {
                    // Both sides moved since the last sync. Keep the
                    // local etag so the conflict resurfaces until it is
                    // resolved.
                    output.conflicts_found += 1;
                    child.etag = local.etag.clone();
                    in_conflict = true;
                }

                // A favourite whose contents moved on the server needs a
                // local copy to refresh; without one the sync cannot
                // complete. Conflicting favourites are counted above.
                if !entry.is_dir
                    && child.keep_in_sync
                    && !in_conflict
                    && entry.etag != local.etag
                    && child.storage_path.is_none()
                {
                    output.favourite_failures += 1;
                }
            }

            if entry.is_dir {
                let changed = match known {
                    Some(local) => local.tree_etag != entry.etag,
                    None => true,
                };
                output.folders_to_visit.push((child.clone(), changed));
            }
            updated.push(child);
        }

        let remote_paths: HashMap<&str, ()> = child_entries
            .iter()
            .map(|entry| (entry.path.as_str(), ()))
            .collect();
        let remote_ids: HashMap<&str, ()> = child_entries
            .iter()
            .filter_map(|entry| entry.remote_id.as_deref())
            .map(|id| (id, ()))
            .collect();
        let removed: Vec<String> = local_children
            .iter()
            .filter(|local| {
                let matched_by_id = local
                    .remote_id
                    .as_deref()
                    .is_some_and(|id| remote_ids.contains_key(id));
                !matched_by_id && !remote_paths.contains_key(local.remote_path.as_str())
            })
            .map(|local| local.remote_path.clone())
            .collect();

        let mut folder = store
            .file_by_path(&self.owner, &self.remote_path)
            .unwrap_or_else(|| LocalFile::folder(&self.remote_path));
        folder.is_dir = true;
        folder.etag = folder_entry.etag.clone();
        folder.tree_etag = folder_entry.etag.clone();
        folder.remote_id = folder_entry.remote_id.clone();
        folder.modified = folder_entry.modified.unwrap_or(folder.modified);

        drop(output);
        store.save_folder(&self.owner, folder, updated, removed);
        Ok(())
    }
}

fn local_file_from_entry(entry: &RemoteEntry) -> LocalFile {
    LocalFile {
        remote_path: entry.path.clone(),
        name: entry.name.clone(),
        is_dir: entry.is_dir,
        etag: entry.etag.clone(),
        tree_etag: if entry.is_dir { entry.etag.clone() } else { None },
        remote_id: entry.remote_id.clone(),
        storage_path: None,
        modified: entry.modified.unwrap_or(0),
        local_modified: 0,
        last_sync: 0,
        keep_in_sync: false,
    }
}
