mod common;

use std::sync::Arc;

use common::{dir, file, online, root, MockSlave};
use dftpd::config::Config;
use dftpd::error::{RemoteError, VfsError};
use dftpd::session::Context;
use dftpd::slave::SlaveSelector;
use dftpd::vfs::{DirectoryTree, Node, RemoteAction};
use dftpd::ReconciliationDriver;

fn merge(tree: &DirectoryTree, listing: &dftpd::listing::ListingEntry, slave: &Arc<dftpd::slave::SlaveHandle>) {
    let actions = tree.remerge(tree.root(), listing, slave).unwrap();
    assert!(actions.is_empty(), "unexpected follow-up work: {:?}", actions);
}

fn owners(node: &Arc<Node>) -> Vec<String> {
    let mut names: Vec<String> = node.slaves().iter().map(|s| s.name().to_string()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn file_missing_from_one_listing_keeps_other_owner() {
    let tree = DirectoryTree::new();
    let m1 = MockSlave::new(root(vec![]));
    let m2 = MockSlave::new(root(vec![]));
    let slave1 = online("slave1", &m1);
    let slave2 = online("slave2", &m2);

    let with_file = root(vec![dir("section", vec![dir("dir1", vec![file("file1", 500)])])]);
    let without_file = root(vec![dir("section", vec![dir("dir1", vec![])])]);

    merge(&tree, &with_file, &slave2);
    // slave1 never had file1
    merge(&tree, &without_file, &slave1);
    let f = tree.lookup_file("/section/dir1/file1").unwrap();
    assert_eq!(owners(&f), vec!["slave2"]);
    assert_eq!(f.length(), 500);

    // slave2 deleted it behind our back
    merge(&tree, &without_file, &slave2);
    assert!(matches!(
        tree.lookup_file("/section/dir1/file1"),
        Err(VfsError::NotFound(_))
    ));
    assert!(tree.lookup_file("/section/dir1").unwrap().is_directory());
}

#[tokio::test]
async fn merge_places_every_reported_file() {
    let tree = DirectoryTree::new();
    let m = MockSlave::new(root(vec![]));
    let slave = online("s1", &m);
    let listing = root(vec![
        file("top", 1),
        dir("a", vec![file("x", 2), dir("b", vec![file("y", 3), file("z", 4)])]),
    ]);
    merge(&tree, &listing, &slave);

    for (path, len) in [("/top", 1), ("/a/x", 2), ("/a/b/y", 3), ("/a/b/z", 4)] {
        let n = tree.lookup_file(path).unwrap();
        assert_eq!(n.length(), len, "{}", path);
        assert!(n.has_slave(&slave), "{}", path);
    }
    // merging the same listing again changes nothing
    merge(&tree, &listing, &slave);
    assert_eq!(owners(&tree.lookup_file("/a/b/z").unwrap()), vec!["s1"]);
}

#[tokio::test]
async fn unmerge_prunes_exclusive_files_and_is_idempotent() {
    let tree = DirectoryTree::new();
    let ma = MockSlave::new(root(vec![]));
    let mb = MockSlave::new(root(vec![]));
    let a = online("a", &ma);
    let b = online("b", &mb);
    merge(&tree, &root(vec![dir("d", vec![file("shared", 5), file("only_a", 6)])]), &a);
    merge(&tree, &root(vec![dir("d", vec![file("shared", 5)])]), &b);

    tree.unmerge(tree.root(), &a);
    assert_eq!(owners(&tree.lookup_file("/d/shared").unwrap()), vec!["b"]);
    assert!(tree.lookup_file("/d/only_a").is_err());

    tree.unmerge(tree.root(), &a);
    assert_eq!(owners(&tree.lookup_file("/d/shared").unwrap()), vec!["b"]);

    tree.unmerge(tree.root(), &b);
    assert!(tree.lookup_file("/d/shared").is_err());
}

#[tokio::test]
async fn differing_sizes_become_a_renamed_sibling() {
    let tree = DirectoryTree::new();
    let (ma, mb, mc) = (
        MockSlave::new(root(vec![])),
        MockSlave::new(root(vec![])),
        MockSlave::new(root(vec![])),
    );
    let (a, b, c) = (online("A", &ma), online("B", &mb), online("C", &mc));

    merge(&tree, &root(vec![file("f", 0)]), &a);
    // local length 0: B's length is adopted
    merge(&tree, &root(vec![file("f", 100)]), &b);
    let f = tree.lookup_file("/f").unwrap();
    assert_eq!(f.length(), 100);
    assert_eq!(owners(&f), vec!["A", "B"]);

    let actions = tree.remerge(tree.root(), &root(vec![file("f", 50)]), &c).unwrap();
    assert_eq!(actions.len(), 1);
    tree.apply_actions(actions, &c).await;

    assert_eq!(mc.calls(), vec!["rename /f / f.C".to_string()]);
    assert_eq!(tree.lookup_file("/f").unwrap().length(), 100);
    let sibling = tree.lookup_file("/f.C").unwrap();
    assert_eq!(sibling.length(), 50);
    assert_eq!(owners(&sibling), vec!["C"]);
}

#[tokio::test]
async fn delete_treats_missing_copy_as_deleted() {
    let tree = DirectoryTree::new();
    let (ma, mb) = (MockSlave::new(root(vec![])), MockSlave::new(root(vec![])));
    let (a, b) = (online("a", &ma), online("b", &mb));
    merge(&tree, &root(vec![file("f", 9)]), &a);
    merge(&tree, &root(vec![file("f", 9)]), &b);
    *mb.delete_error.lock() = Some(RemoteError::NotFound("/f".into()));

    let f = tree.lookup_file("/f").unwrap();
    tree.delete(&f).await.unwrap();
    assert_eq!(ma.called("delete /f"), 1);
    assert_eq!(mb.called("delete /f"), 1);
    assert!(tree.lookup_file("/f").is_err());
    assert!(a.is_available() && b.is_available());
}

#[tokio::test]
async fn failed_delete_is_reissued_on_remerge() {
    let ctx = Arc::new(Context::new(Config::default()));
    let driver = ReconciliationDriver::new(ctx.clone());
    let tree = &ctx.tree;
    let m = MockSlave::new(root(vec![dir("d", vec![file("f", 9)])]));
    let slave = online("s1", &m);
    driver.remerge_slave(&slave).await.unwrap();

    *m.delete_error.lock() = Some(RemoteError::Communication("link reset".into()));
    let d = tree.lookup_file("/d").unwrap();
    tree.delete(&d).await.unwrap();
    assert!(!slave.is_available());
    // tombstoned: hidden from listings, still waiting on s1
    assert!(tree.list_children(tree.root()).unwrap().is_empty());
    let f = d.child("f").unwrap();
    assert!(f.is_deleted());
    assert_eq!(owners(&f), vec!["s1"]);

    *m.delete_error.lock() = None;
    driver.remerge_slave(&slave).await.unwrap();
    assert!(slave.is_available());
    assert_eq!(m.called("delete /d/f"), 2);
    assert!(tree.root().child("d").is_none());
}

#[tokio::test]
async fn rename_moves_copies_and_refuses_offline_owners() {
    let tree = DirectoryTree::new();
    let m = MockSlave::new(root(vec![]));
    let slave = online("s1", &m);
    merge(&tree, &root(vec![dir("a", vec![file("f", 3)]), dir("b", vec![])]), &slave);

    let f = tree.lookup_file("/a/f").unwrap();
    tree.rename(&f, "/b", "g").await.unwrap();
    assert_eq!(f.path(), "/b/g");
    assert_eq!(m.calls(), vec!["rename /a/f /b g".to_string()]);
    assert!(tree.lookup_file("/a/f").is_err());

    let b = tree.lookup_file("/b").unwrap();
    assert!(matches!(
        tree.rename(&b, "/b", "c").await,
        Err(VfsError::IllegalName(_))
    ));

    slave.mark_unavailable("test");
    assert!(matches!(
        tree.rename(&f, "/a", "h").await,
        Err(VfsError::OfflineSlaves(_))
    ));
}

#[tokio::test]
async fn checksum_is_fetched_once() {
    let tree = DirectoryTree::new();
    let m = MockSlave::new(root(vec![]));
    m.checksum.store(0xfeed, std::sync::atomic::Ordering::Relaxed);
    let slave = online("s1", &m);
    merge(&tree, &root(vec![file("f", 10), file("empty", 0)]), &slave);
    let selector = SlaveSelector::default();

    let f = tree.lookup_file("/f").unwrap();
    assert_eq!(tree.checksum(&f, &selector).await.unwrap(), 0xfeed);
    assert_eq!(tree.checksum(&f, &selector).await.unwrap(), 0xfeed);
    assert_eq!(m.called("checksum"), 1);

    let empty = tree.lookup_file("/empty").unwrap();
    assert_eq!(tree.checksum(&empty, &selector).await.unwrap(), dftpd::checksum::UNKNOWN);
    assert_eq!(m.called("checksum"), 1);
}

#[tokio::test]
async fn sweep_retries_tombstones_and_reports_old_directories() {
    let ctx = Arc::new(Context::new(Config::default()));
    let driver = ReconciliationDriver::new(ctx.clone());
    let m = MockSlave::new(root(vec![dir("section", vec![file("f", 1)])]));
    let slave = online("s1", &m);
    driver.remerge_slave(&slave).await.unwrap();

    *m.delete_error.lock() = Some(RemoteError::Communication("timeout".into()));
    let f = ctx.tree.lookup_file("/section/f").unwrap();
    ctx.tree.delete(&f).await.unwrap();
    assert!(f.is_deleted());

    // offline owner: nothing to retry yet
    let report = driver.sweep().await;
    assert_eq!(report.retried, 0);
    assert_eq!(report.pruned, 0);

    *m.delete_error.lock() = None;
    assert!(slave.set_available());
    let report = driver.sweep().await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.pruned, 1);
    assert!(ctx.tree.root().child("section").unwrap().child("f").is_none());
    // listing directories carry no timestamp, so they are long due
    assert_eq!(report.archive_candidates, vec!["/section".to_string()]);
}

#[tokio::test]
async fn sweep_skips_excluded_sections() {
    let mut config = Config::default();
    config.sections.insert("mp3".into(), "/mp3".into());
    config.archive.exclude.push("mp3".into());
    let ctx = Arc::new(Context::new(config));
    let driver = ReconciliationDriver::new(ctx.clone());
    let m = MockSlave::new(root(vec![dir("mp3", vec![dir("old", vec![])])]));
    let slave = online("s1", &m);
    driver.remerge_slave(&slave).await.unwrap();

    assert_eq!(driver.sweep().await, Default::default());
}

#[tokio::test]
async fn remerge_fetches_one_subtree_per_top_level_directory() {
    let ctx = Arc::new(Context::new(Config::default()));
    let driver = ReconciliationDriver::new(ctx.clone());
    let tree = &ctx.tree;
    let m = MockSlave::new(root(vec![
        file("top", 1),
        dir("a", vec![file("x", 2)]),
        dir("b", vec![dir("c", vec![file("y", 3)])]),
    ]));
    let slave = online("s1", &m);
    // left over from an earlier session, no longer on the slave
    merge(tree, &root(vec![file("old", 4)]), &slave);

    driver.remerge_slave(&slave).await.unwrap();
    assert_eq!(
        m.calls(),
        vec!["listing /".to_string(), "listing /a".to_string(), "listing /b".to_string()]
    );
    for (path, len) in [("/top", 1), ("/a/x", 2), ("/b/c/y", 3)] {
        let n = tree.lookup_file(path).unwrap();
        assert_eq!(n.length(), len, "{}", path);
        assert_eq!(owners(&n), vec!["s1"], "{}", path);
    }
    assert!(tree.lookup_file("/old").is_err());
}

#[tokio::test]
async fn kind_mismatch_leaves_the_subtree_alone() {
    let tree = DirectoryTree::new();
    let m = MockSlave::new(root(vec![]));
    let a = online("A", &m);
    merge(&tree, &root(vec![dir("x", vec![file("f", 5)])]), &a);

    // the slave now has a plain file where the tree has a directory
    merge(&tree, &root(vec![file("x", 7)]), &a);
    let x = tree.lookup_file("/x").unwrap();
    assert!(x.is_directory());
    let f = tree.lookup_file("/x/f").unwrap();
    assert_eq!(f.length(), 5);
    assert_eq!(owners(&f), vec!["A"]);
    assert!(m.calls().is_empty());
}

#[tokio::test]
async fn empty_copy_next_to_a_full_one_is_deleted() {
    let tree = DirectoryTree::new();
    let (ma, mb) = (MockSlave::new(root(vec![])), MockSlave::new(root(vec![])));
    let (a, b) = (online("A", &ma), online("B", &mb));
    merge(&tree, &root(vec![file("f", 100)]), &a);

    let actions = tree.remerge(tree.root(), &root(vec![file("f", 0)]), &b).unwrap();
    assert_eq!(actions.len(), 1);
    assert!(matches!(actions[0], RemoteAction::DeleteStale { .. }));
    tree.apply_actions(actions, &b).await;

    assert_eq!(mb.calls(), vec!["delete /f".to_string()]);
    assert!(ma.calls().is_empty());
    let f = tree.lookup_file("/f").unwrap();
    assert_eq!(f.length(), 100);
    assert_eq!(owners(&f), vec!["A"]);
}

#[tokio::test]
async fn rename_onto_a_pending_deletion_is_refused() {
    let tree = DirectoryTree::new();
    let (ma, mb) = (MockSlave::new(root(vec![])), MockSlave::new(root(vec![])));
    let (a, b) = (online("A", &ma), online("B", &mb));
    merge(&tree, &root(vec![dir("a", vec![file("f", 3)])]), &a);
    merge(&tree, &root(vec![dir("b", vec![file("g", 4)])]), &b);

    *mb.delete_error.lock() = Some(RemoteError::Communication("link reset".into()));
    let g = tree.lookup_file("/b/g").unwrap();
    tree.delete(&g).await.unwrap();
    assert!(g.is_deleted());

    let f = tree.lookup_file("/a/f").unwrap();
    assert!(matches!(
        tree.rename(&f, "/b", "g").await,
        Err(VfsError::PendingDeletion(_))
    ));
    assert_eq!(f.path(), "/a/f");
    tree.rename(&f, "/b", "h").await.unwrap();
    assert_eq!(f.path(), "/b/h");
}
