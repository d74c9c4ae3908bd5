//! User accounting and path permissions as seen by the transfer engine
//!
//! Both are owned by collaborators outside this crate (user database,
//! permission rules). The controller only needs the narrow surface below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use parking_lot::Mutex;

/// Path rules consulted around transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    Upload,
    Download,
    /// Data channels must be encrypted
    DenyUnencryptedData,
    /// Uploads do not count towards the user's statistics
    NoStatsUp,
    NoStatsDown,
}

impl Rule {
    /// Rules that restrict the user when they match
    pub fn is_restriction(self) -> bool {
        matches!(self, Rule::DenyUnencryptedData | Rule::NoStatsUp | Rule::NoStatsDown)
    }
}

pub trait Permissions: Send + Sync {
    /// Does `rule` apply to `user` at `path` (or, with `recursive`, at any
    /// of its parents)?
    fn check_path_permission(&self, rule: Rule, user: &str, path: &str, recursive: bool) -> bool;
}

/// No rules configured: everything is granted, nothing is restricted
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Permissions for AllowAll {
    fn check_path_permission(&self, rule: Rule, _user: &str, _path: &str, _recursive: bool) -> bool {
        !rule.is_restriction()
    }
}

pub trait Accounting: Send + Sync {
    fn update_credits(&self, user: &str, delta: i64);
    fn update_uploaded_bytes(&self, user: &str, bytes: u64);
    fn update_downloaded_bytes(&self, user: &str, bytes: u64);
    /// Persist the user's record
    fn commit(&self, user: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserStats {
    pub credits: i64,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub uploaded_files: u64,
    pub downloaded_files: u64,
    pub commits: u64,
}

/// In-process accounting; what the daemon uses when no user database is
/// plugged in
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    users: Mutex<HashMap<String, UserStats>>,
    fail_commits: AtomicBool,
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, user: &str) -> UserStats {
        self.users.lock().get(user).copied().unwrap_or_default()
    }

    /// Make every following `commit` fail, as a broken user store would
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Relaxed);
    }

    fn with_user(&self, user: &str, f: impl FnOnce(&mut UserStats)) {
        f(self.users.lock().entry(user.to_string()).or_default());
    }
}

impl Accounting for MemoryAccounting {
    fn update_credits(&self, user: &str, delta: i64) {
        self.with_user(user, |s| s.credits = s.credits.saturating_add(delta));
    }

    fn update_uploaded_bytes(&self, user: &str, bytes: u64) {
        self.with_user(user, |s| {
            s.uploaded_bytes += bytes;
            s.uploaded_files += 1;
        });
    }

    fn update_downloaded_bytes(&self, user: &str, bytes: u64) {
        self.with_user(user, |s| {
            s.downloaded_bytes += bytes;
            s.downloaded_files += 1;
        });
    }

    fn commit(&self, user: &str) -> Result<()> {
        if self.fail_commits.load(Ordering::Relaxed) {
            bail!("cannot write user file for {}", user);
        }
        self.with_user(user, |s| s.commits += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_grants_but_never_restricts() {
        let p = AllowAll;
        assert!(p.check_path_permission(Rule::Upload, "u", "/a", true));
        assert!(p.check_path_permission(Rule::Download, "u", "/a", true));
        assert!(!p.check_path_permission(Rule::DenyUnencryptedData, "u", "/a", true));
        assert!(!p.check_path_permission(Rule::NoStatsDown, "u", "/a", false));
    }

    #[test]
    fn memory_accounting_tracks_per_user() {
        let a = MemoryAccounting::new();
        a.update_credits("alice", 300);
        a.update_credits("alice", -100);
        a.update_uploaded_bytes("alice", 100);
        a.update_downloaded_bytes("bob", 7);
        a.commit("alice").unwrap();
        let s = a.stats("alice");
        assert_eq!(s.credits, 200);
        assert_eq!(s.uploaded_bytes, 100);
        assert_eq!(s.uploaded_files, 1);
        assert_eq!(s.commits, 1);
        assert_eq!(a.stats("bob").downloaded_bytes, 7);

        a.set_fail_commits(true);
        assert!(a.commit("alice").is_err());
    }
}
