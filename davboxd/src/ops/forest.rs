use std::collections::HashMap;

/// Identity of a pending folder sync: which account, which folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForestKey {
    pub owner: String,
    pub path: String,
}

impl ForestKey {
    pub fn new(owner: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug)]
pub struct RemovedEntry<T> {
    pub key: ForestKey,
    pub payload: T,
}

/// Pending folder syncs, at most one live entry per (owner, path).
#[derive(Debug)]
pub struct IndexedForest<T> {
    entries: HashMap<ForestKey, T>,
}

impl<T> Default for IndexedForest<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> IndexedForest<T> {
    /// Inserts unless the key is already present. Returns whether the
    /// payload went in; an existing payload is never overwritten.
    pub fn try_insert(&mut self, owner: &str, path: &str, payload: T) -> bool {
        let key = ForestKey::new(owner, path);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, payload);
        true
    }

    pub fn get(&self, owner: &str, path: &str) -> Option<&T> {
        self.entries.get(&ForestKey::new(owner, path))
    }

    pub fn contains(&self, owner: &str, path: &str) -> bool {
        self.entries.contains_key(&ForestKey::new(owner, path))
    }

    pub fn remove(&mut self, owner: &str, path: &str) -> Option<RemovedEntry<T>> {
        let key = ForestKey::new(owner, path);
        let payload = self.entries.remove(&key)?;
        Some(RemovedEntry { key, payload })
    }

    /// True when `path` itself or anything under it is pending.
    pub fn contains_descendant(&self, owner: &str, path: &str) -> bool {
        self.entries
            .keys()
            .any(|key| key.owner == owner && is_descendant_path(&key.path, path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether `candidate` equals `ancestor` or lies below it, respecting
/// segment boundaries.
pub fn is_descendant_path(candidate: &str, ancestor: &str) -> bool {
    if candidate == ancestor {
        return true;
    }
    let prefix = if ancestor.ends_with('/') {
        ancestor.to_string()
    } else {
        format!("{ancestor}/")
    };
    candidate.starts_with(&prefix)
}
