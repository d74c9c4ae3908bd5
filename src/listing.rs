//! Slave file listings
//!
//! A listing is the lightweight, serialisable picture of a slave's storage
//! root that travels over the slave link and feeds `DirectoryTree::remerge`.
//! It carries no owner sets and no locks; it is decoupled from the live tree.

use anyhow::{bail, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol_core::is_legal_file_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    /// Milliseconds since the epoch
    pub last_modified: i64,
    pub kind: ListingKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingKind {
    File { length: u64 },
    Directory { entries: Vec<ListingEntry> },
}

impl ListingEntry {
    pub fn file(name: impl Into<String>, length: u64, last_modified: i64) -> Self {
        Self {
            name: name.into(),
            last_modified,
            kind: ListingKind::File { length },
        }
    }

    pub fn dir(name: impl Into<String>, entries: Vec<ListingEntry>) -> Self {
        Self {
            name: name.into(),
            last_modified: 0,
            kind: ListingKind::Directory { entries },
        }
    }

    /// Root of a slave listing
    pub fn root(entries: Vec<ListingEntry>) -> Self {
        Self::dir("", entries)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ListingKind::Directory { .. })
    }

    pub fn length(&self) -> u64 {
        match self.kind {
            ListingKind::File { length } => length,
            ListingKind::Directory { .. } => 0,
        }
    }

    pub fn entries(&self) -> &[ListingEntry] {
        match &self.kind {
            ListingKind::Directory { entries } => entries,
            ListingKind::File { .. } => &[],
        }
    }

    pub fn child(&self, name: &str) -> Option<&ListingEntry> {
        self.entries().iter().find(|e| e.name == name)
    }

    /// Number of files below this entry
    pub fn file_count(&self) -> usize {
        match &self.kind {
            ListingKind::File { .. } => 1,
            ListingKind::Directory { entries } => entries.iter().map(|e| e.file_count()).sum(),
        }
    }
}

/// Listing filter options
pub struct ListingFilter {
    pub exclude_files: Vec<String>,
    pub include_empty_dirs: bool,
}

impl Default for ListingFilter {
    fn default() -> Self {
        Self {
            // in-flight uploads of other tools
            exclude_files: vec!["*.tmp".to_string()],
            include_empty_dirs: false,
        }
    }
}

impl ListingFilter {
    fn should_include_file(&self, name: &str) -> bool {
        !self.exclude_files.iter().any(|p| glob_match(p, name))
    }
}

/// Simple glob matching (supports * wildcards)
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if pattern.contains('*') {
        if pattern.starts_with('*') && pattern.ends_with('*') {
            let middle = &pattern[1..pattern.len() - 1];
            return text.contains(middle);
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            return text.ends_with(suffix);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            return text.starts_with(prefix);
        }
    }

    pattern == text
}

/// Whether a recursive listing of `dir` would come back with any file
fn holds_files(dir: &Path, filter: &ListingFilter) -> bool {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name().to_str().is_some_and(is_legal_file_name))
        .filter_map(|e| e.ok())
        .any(|e| {
            e.file_type().is_file()
                && e.file_name().to_str().is_some_and(|n| filter.should_include_file(n))
        })
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Listing entry `name` for the directory `dir`. Without `recursive`,
/// subdirectories are reported with no entries.
///
/// Names that are not UTF-8 or not legal in the tree are skipped: the
/// master could never address them again.
pub fn enumerate_dir(
    dir: &Path,
    name: &str,
    filter: &ListingFilter,
    recursive: bool,
) -> Result<ListingEntry> {
    use walkdir::WalkDir;

    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                continue;
            }
        };
        let Some(child) = entry.file_name().to_str() else {
            warn!("skipping non UTF-8 name {:?} under {}", entry.file_name(), dir.display());
            continue;
        };
        if !is_legal_file_name(child) {
            warn!("skipping illegal file name {:?} under {}", child, dir.display());
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };

        if entry.file_type().is_dir() {
            if !recursive {
                if !filter.include_empty_dirs && !holds_files(entry.path(), filter) {
                    continue;
                }
                let mut d = ListingEntry::dir(child, Vec::new());
                d.last_modified = mtime_millis(&meta);
                entries.push(d);
                continue;
            }
            let d = enumerate_dir(entry.path(), child, filter, true)?;
            if filter.include_empty_dirs || !d.entries().is_empty() {
                entries.push(d);
            }
        } else if entry.file_type().is_file() && filter.should_include_file(child) {
            entries.push(ListingEntry::file(child, meta.len(), mtime_millis(&meta)));
        }
    }

    let mut listing = ListingEntry::dir(name, entries);
    listing.last_modified = std::fs::metadata(dir).map(|m| mtime_millis(&m)).unwrap_or(0);
    Ok(listing)
}
