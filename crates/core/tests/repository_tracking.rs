//! Integration tests for reading and tracking repository state.
//!
//! Every test builds a real repository with `git2` inside a temporary
//! directory and drives it through the public API only.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use git2::{Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

use repotrack_core::models::{RepositoryState, SnapshotField};
use repotrack_core::repo::{RepositoryChangeEvent, RepositoryManager, RepositoryReader, RepositoryTracker};

// ===========================================================================
// Helpers
// ===========================================================================

fn init_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir.path(), &opts).unwrap();
    (dir, repo)
}

fn commit_file(repo: &Repository, name: &str, content: &str) -> git2::Oid {
    let workdir = repo.workdir().unwrap().to_path_buf();
    std::fs::write(workdir.join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &parents)
        .unwrap()
}

fn counting_tracker(root: &Path) -> (RepositoryTracker, Arc<AtomicUsize>) {
    let tracker = RepositoryTracker::open(root).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    tracker.subscribe(move |_: &RepositoryChangeEvent| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    (tracker, count)
}

// ===========================================================================
// Reader
// ===========================================================================

#[test]
fn zero_commit_repository_reads_as_normal_on_initial_branch() {
    let (dir, _repo) = init_repo();
    let snapshot = RepositoryReader::open(dir.path()).unwrap().try_read().unwrap();

    assert_eq!(snapshot.state, RepositoryState::Normal);
    assert_eq!(snapshot.current_branch.as_deref(), Some("main"));
    assert_eq!(snapshot.current_revision, None);
    assert!(snapshot.branches.is_empty());
}

#[test]
fn detached_head_has_no_branch() {
    let (dir, repo) = init_repo();
    let oid = commit_file(&repo, "a.txt", "one\n");
    repo.set_head_detached(oid).unwrap();

    let snapshot = RepositoryReader::open(dir.path()).unwrap().try_read().unwrap();
    assert_eq!(snapshot.state, RepositoryState::Detached);
    assert_eq!(snapshot.current_branch, None);
    assert_eq!(snapshot.current_revision, Some(oid.to_string()));
}

#[test]
fn packed_refs_are_listed_and_loose_refs_win() {
    let (dir, repo) = init_repo();
    let first = commit_file(&repo, "a.txt", "one\n");
    let second = commit_file(&repo, "a.txt", "two\n");
    let git_dir = repo.path().to_path_buf();

    std::fs::write(
        git_dir.join("packed-refs"),
        format!(
            "# pack-refs with: peeled fully-peeled sorted \n\
             {first} refs/heads/main\n\
             {first} refs/remotes/origin/main\n\
             {first} refs/tags/v1.0\n"
        ),
    )
    .unwrap();

    let snapshot = RepositoryReader::open(dir.path()).unwrap().try_read().unwrap();
    // Loose refs/heads/main points at the second commit and shadows the packed entry.
    assert_eq!(snapshot.branches.find_local("main").unwrap().target(), second.to_string());
    assert_eq!(
        snapshot.branches.find_remote("origin/main").unwrap().target(),
        first.to_string()
    );
    assert_eq!(snapshot.branches.tags.len(), 1);
    assert_eq!(snapshot.current_revision, Some(second.to_string()));
}

// ===========================================================================
// Tracker
// ===========================================================================

#[test]
fn no_event_when_nothing_changed() {
    let (dir, repo) = init_repo();
    commit_file(&repo, "a.txt", "one\n");
    let (tracker, count) = counting_tracker(dir.path());

    assert!(tracker.update().is_none());
    assert!(tracker.update().is_none());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn exactly_one_event_per_change() {
    let (dir, repo) = init_repo();
    commit_file(&repo, "a.txt", "one\n");
    let (tracker, count) = counting_tracker(dir.path());

    commit_file(&repo, "a.txt", "two\n");
    let event = tracker.update().expect("commit should produce an event");
    assert!(event.touches(SnapshotField::CurrentRevision));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert!(tracker.update().is_none());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn checking_out_new_branch_keeps_revision() {
    let (dir, repo) = init_repo();
    let oid = commit_file(&repo, "a.txt", "one\n");
    let tracker = RepositoryTracker::open(dir.path()).unwrap();
    let seen: Arc<Mutex<Vec<RepositoryChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.subscribe(move |e: &RepositoryChangeEvent| sink.lock().unwrap().push(e.clone()));

    let head = repo.find_commit(oid).unwrap();
    repo.branch("feature", &head, false).unwrap();
    repo.set_head("refs/heads/feature").unwrap();
    tracker.update().unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.current.current_branch.as_deref(), Some("feature"));
    assert_eq!(event.previous.current_branch.as_deref(), Some("main"));
    assert_eq!(event.current.current_revision, Some(oid.to_string()));
    assert!(event.touches(SnapshotField::CurrentBranch));
    assert!(event.touches(SnapshotField::Branches));
    assert!(!event.touches(SnapshotField::CurrentRevision));
}

#[test]
fn merge_marker_produces_state_event() {
    let (dir, repo) = init_repo();
    let oid = commit_file(&repo, "a.txt", "one\n");
    let (tracker, count) = counting_tracker(dir.path());

    std::fs::write(repo.path().join("MERGE_HEAD"), format!("{}\n", oid)).unwrap();
    let event = tracker.update().unwrap();
    assert_eq!(event.changed, vec![SnapshotField::State]);
    assert_eq!(event.current.state, RepositoryState::Merging);

    std::fs::remove_file(repo.path().join("MERGE_HEAD")).unwrap();
    assert_eq!(tracker.update().unwrap().current.state, RepositoryState::Normal);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn unsubscribed_listener_is_not_called() {
    let (dir, repo) = init_repo();
    commit_file(&repo, "a.txt", "one\n");
    let tracker = RepositoryTracker::open(dir.path()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let id = tracker.subscribe(move |_: &RepositoryChangeEvent| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    assert!(tracker.unsubscribe(id));
    assert!(!tracker.unsubscribe(id));

    commit_file(&repo, "a.txt", "two\n");
    assert!(tracker.update().is_some());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn listener_sees_new_snapshot() {
    let (dir, repo) = init_repo();
    commit_file(&repo, "a.txt", "one\n");
    let tracker = Arc::new(RepositoryTracker::open(dir.path()).unwrap());
    let observed = Arc::new(Mutex::new(None));

    let t = Arc::downgrade(&tracker);
    let o = Arc::clone(&observed);
    tracker.subscribe(move |_: &RepositoryChangeEvent| {
        if let Some(t) = t.upgrade() {
            *o.lock().unwrap() = t.snapshot().current_revision;
        }
    });

    let oid = commit_file(&repo, "a.txt", "two\n");
    tracker.update().unwrap();
    assert_eq!(*observed.lock().unwrap(), Some(oid.to_string()));
}

// ===========================================================================
// Manager
// ===========================================================================

#[test]
fn manager_maps_paths_to_deepest_root_and_updates_all() {
    let (outer, outer_repo) = init_repo();
    commit_file(&outer_repo, "a.txt", "one\n");
    let inner_path = outer.path().join("vendor").join("lib");
    std::fs::create_dir_all(&inner_path).unwrap();
    let inner_repo = Repository::init(&inner_path).unwrap();
    commit_file(&inner_repo, "b.txt", "one\n");

    let manager = RepositoryManager::new();
    manager.track(outer.path()).unwrap();
    manager.track(&inner_path).unwrap();

    let file = inner_path.join("b.txt");
    let tracker = manager.repository_for_path(&file).unwrap();
    assert_eq!(
        std::fs::canonicalize(tracker.root()).unwrap(),
        std::fs::canonicalize(&inner_path).unwrap()
    );

    assert!(manager.update_all().is_empty());
    commit_file(&inner_repo, "b.txt", "two\n");
    let events = manager.update_all();
    assert_eq!(events.len(), 1);
}
