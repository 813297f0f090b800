//! Directory cache and learned directory-change cache.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote_file::{unix_exclude_trailing_slash, unix_is_child_path, RemoteFileList};

/// Path -> listing map with retrieval timestamps, capped by entry count with
/// oldest-first eviction.
pub struct DirectoryCache {
    capacity: usize,
    entries: Vec<(String, RemoteFileList)>,
}

impl DirectoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    fn position(&self, path: &str) -> Option<usize> {
        let path = unix_exclude_trailing_slash(path);
        self.entries.iter().position(|(p, _)| *p == path)
    }

    pub fn has_file_list(&self, path: &str) -> bool {
        self.position(path).is_some()
    }

    pub fn has_newer_file_list(&self, path: &str, than: DateTime<Utc>) -> bool {
        self.position(path)
            .map(|index| self.entries[index].1.timestamp > than)
            .unwrap_or(false)
    }

    /// Returns the cached listing iff present and, when `newer_than` is
    /// given, strictly newer than it.
    pub fn get_file_list(
        &self,
        path: &str,
        newer_than: Option<DateTime<Utc>>,
    ) -> Option<RemoteFileList> {
        let index = self.position(path)?;
        let list = &self.entries[index].1;
        match newer_than {
            Some(than) if list.timestamp <= than => None,
            _ => Some(list.clone()),
        }
    }

    /// Takes ownership of a copy of the listing.
    pub fn add_file_list(&mut self, list: RemoteFileList) {
        let path = unix_exclude_trailing_slash(list.directory());
        if let Some(index) = self.position(&path) {
            self.entries.remove(index);
        } else if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push((path, list));
    }

    /// Removes exactly `path` and, when `sub_dirs` is set, every descendant.
    pub fn clear_file_list(&mut self, path: &str, sub_dirs: bool) {
        let path = unix_exclude_trailing_slash(path);
        self.entries
            .retain(|(p, _)| *p != path && !(sub_dirs && unix_is_child_path(&path, p)));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryChange {
    source: String,
    requested: String,
    resolved: String,
}

/// Learned `(cwd, cd-request) -> resolved-cwd` map with LRU eviction,
/// serializable to an opaque blob for per-session persistence.
pub struct DirectoryChangeCache {
    capacity: usize,
    entries: Vec<DirectoryChange>,
}

impl DirectoryChangeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    fn key_matches(entry: &DirectoryChange, source: &str, requested: &str) -> bool {
        if requested.starts_with('/') {
            // Absolute requests resolve the same from anywhere.
            entry.requested == requested
        } else {
            entry.source == source && entry.requested == requested
        }
    }

    pub fn add_directory_change(&mut self, source: &str, requested: &str, resolved: &str) {
        if requested.is_empty() || resolved.is_empty() {
            return;
        }
        let source = unix_exclude_trailing_slash(source);
        let resolved = unix_exclude_trailing_slash(resolved);
        self.entries
            .retain(|entry| !Self::key_matches(entry, &source, requested));
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(DirectoryChange {
            source,
            requested: requested.to_string(),
            resolved,
        });
    }

    pub fn get_directory_change(&mut self, source: &str, requested: &str) -> Option<String> {
        let source = unix_exclude_trailing_slash(source);
        let index = self
            .entries
            .iter()
            .position(|entry| Self::key_matches(entry, &source, requested))?;
        // Touch for LRU.
        let entry = self.entries.remove(index);
        let resolved = entry.resolved.clone();
        self.entries.push(entry);
        Some(resolved)
    }

    /// Drop entries that referenced `path` (as source or target).
    pub fn directory_modified(&mut self, path: &str) {
        let path = unix_exclude_trailing_slash(path);
        self.entries
            .retain(|entry| entry.source != path && entry.resolved != path);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opaque blob for the host's configuration store.
    pub fn serialize(&self) -> String {
        let json = serde_json::to_string(&self.entries).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    pub fn deserialize(&mut self, blob: &str) {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(blob) else {
            return;
        };
        let Ok(entries) = serde_json::from_slice::<Vec<DirectoryChange>>(&bytes) else {
            return;
        };
        self.entries = entries;
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }
}
