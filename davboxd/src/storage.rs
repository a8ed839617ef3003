use std::collections::HashMap;
use std::sync::Mutex;

/// Locally known state of one remote file or folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub remote_path: String,
    pub name: String,
    pub is_dir: bool,
    pub etag: Option<String>,
    /// Folders only: etag covering the whole subtree, compared against
    /// the server etag to decide whether a child needs a real fetch.
    pub tree_etag: Option<String>,
    pub remote_id: Option<String>,
    /// Path of the downloaded copy; None while the file is cloud-only.
    pub storage_path: Option<String>,
    pub modified: i64,
    pub local_modified: i64,
    pub last_sync: i64,
    pub keep_in_sync: bool,
}

impl LocalFile {
    pub fn folder(remote_path: impl Into<String>) -> Self {
        let remote_path = remote_path.into();
        let name = remote_path
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "/".to_string());
        Self {
            remote_path,
            name,
            is_dir: true,
            etag: None,
            tree_etag: None,
            remote_id: None,
            storage_path: None,
            modified: 0,
            local_modified: 0,
            last_sync: 0,
            keep_in_sync: false,
        }
    }

    /// True when the downloaded copy changed after the last sync.
    pub fn changed_locally(&self) -> bool {
        self.storage_path.is_some() && self.local_modified > self.last_sync
    }
}

/// Storage collaborator consumed by the sync engine. The daemon ships
/// an in-memory implementation; a database-backed one plugs in here.
pub trait FileStore: Send + Sync {
    fn file_by_path(&self, owner: &str, remote_path: &str) -> Option<LocalFile>;
    fn folder_content(&self, owner: &str, remote_path: &str) -> Vec<LocalFile>;
    /// Persists a reconciled folder: the folder's own record, the
    /// surviving children, and the paths of children that vanished
    /// remotely.
    fn save_folder(
        &self,
        owner: &str,
        folder: LocalFile,
        children: Vec<LocalFile>,
        removed_paths: Vec<String>,
    );
    fn remove_folder(&self, owner: &str, remote_path: &str);
    fn save_file(&self, owner: &str, file: LocalFile);
    /// Whether a storage path lies inside the area this store manages.
    /// Records pointing elsewhere are stray and must not be adopted.
    fn is_managed(&self, storage_path: &str) -> bool;
}

#[derive(Debug)]
pub struct MemoryStore {
    storage_root: String,
    files: Mutex<HashMap<(String, String), LocalFile>>,
}

impl MemoryStore {
    pub fn new(storage_root: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn key(owner: &str, remote_path: &str) -> (String, String) {
        (owner.to_string(), normalize(remote_path))
    }
}

fn normalize(remote_path: &str) -> String {
    if remote_path.len() > 1 {
        remote_path.trim_end_matches('/').to_string()
    } else {
        remote_path.to_string()
    }
}

fn is_direct_child(parent: &str, candidate: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(parent) else {
        return false;
    };
    let rest = if parent == "/" {
        rest
    } else {
        match rest.strip_prefix('/') {
            Some(rest) => rest,
            None => return false,
        }
    };
    !rest.is_empty() && !rest.contains('/')
}

impl FileStore for MemoryStore {
    fn file_by_path(&self, owner: &str, remote_path: &str) -> Option<LocalFile> {
        self.files
            .lock()
            .unwrap()
            .get(&Self::key(owner, remote_path))
            .cloned()
    }

    fn folder_content(&self, owner: &str, remote_path: &str) -> Vec<LocalFile> {
        let parent = normalize(remote_path);
        let files = self.files.lock().unwrap();
        let mut content: Vec<LocalFile> = files
            .iter()
            .filter(|((file_owner, path), _)| {
                file_owner == owner && is_direct_child(&parent, path)
            })
            .map(|(_, file)| file.clone())
            .collect();
        content.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        content
    }

    fn save_folder(
        &self,
        owner: &str,
        folder: LocalFile,
        children: Vec<LocalFile>,
        removed_paths: Vec<String>,
    ) {
        let mut files = self.files.lock().unwrap();
        for removed in removed_paths {
            let removed = normalize(&removed);
            files.retain(|(file_owner, path), _| {
                !(file_owner == owner
                    && (path == &removed || path.starts_with(&format!("{removed}/"))))
            });
        }
        files.insert(Self::key(owner, &folder.remote_path), folder);
        for child in children {
            files.insert(Self::key(owner, &child.remote_path), child);
        }
    }

    fn remove_folder(&self, owner: &str, remote_path: &str) {
        let folder = normalize(remote_path);
        let prefix = format!("{}/", folder.trim_end_matches('/'));
        self.files.lock().unwrap().retain(|(file_owner, path), _| {
            !(file_owner == owner && (path == &folder || path.starts_with(&prefix)))
        });
    }

    fn save_file(&self, owner: &str, file: LocalFile) {
        self.files
            .lock()
            .unwrap()
            .insert(Self::key(owner, &file.remote_path), file);
    }

    fn is_managed(&self, storage_path: &str) -> bool {
        storage_path.starts_with(&self.storage_root)
    }
}
