// End-to-end tests for the mirror pull engine: coordinator + reconciler
// against a scripted remote and an in-memory local store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bookmark_mirror::auth::{TokenStatus, TokenValidator};
use bookmark_mirror::coordinator::{RunCoordinator, Trigger};
use bookmark_mirror::error::{FetchError, SyncError};
use bookmark_mirror::local_store::{LocalStore, MemoryStore};
use bookmark_mirror::notify::Notifier;
use bookmark_mirror::remote::{RemoteForest, RemoteItem, RemoteNode, RemoteSource};
use bookmark_mirror::state::MirrorState;
use tokio::sync::Notify;

fn node(id: i64, title: &str, parent: Option<i64>) -> RemoteNode {
    RemoteNode {
        id,
        title: title.to_string(),
        parent_id: parent,
        cover: None,
        sort_index: id,
    }
}

fn item(id: i64, title: &str, url: &str, collection: i64) -> RemoteItem {
    RemoteItem {
        id,
        title: title.to_string(),
        url: url.to_string(),
        collection_id: collection,
        last_modified: None,
    }
}

fn forest(nodes: Vec<RemoteNode>, items: Vec<RemoteItem>) -> RemoteForest {
    let mut f = RemoteForest::default();
    for n in nodes {
        f.items.entry(n.id).or_default();
        f.nodes.insert(n.id, n);
    }
    for i in items {
        f.items.entry(i.collection_id).or_default().push(i);
    }
    f
}

/// Remote that serves a pre-scripted sequence of fetch results.
struct ScriptedRemote {
    script: Mutex<VecDeque<Result<RemoteForest, FetchError>>>,
}

impl ScriptedRemote {
    fn new(script: Vec<Result<RemoteForest, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

impl RemoteSource for ScriptedRemote {
    async fn fetch_remote_tree(&self) -> Result<RemoteForest, FetchError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted remote exhausted")
    }
}

/// Remote that parks in the fetch until released, to hold the latch open.
struct BlockingRemote {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl RemoteSource for BlockingRemote {
    async fn fetch_remote_tree(&self) -> Result<RemoteForest, FetchError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(forest(vec![node(1, "A", None)], vec![]))
    }
}

struct ValidToken;

impl TokenValidator for ValidToken {
    fn validate(&self) -> anyhow::Result<TokenStatus> {
        Ok(TokenStatus {
            is_valid: true,
            needs_reauth: false,
            access_token: Some("test-token".to_string()),
        })
    }
}

struct NoToken;

impl TokenValidator for NoToken {
    fn validate(&self) -> anyhow::Result<TokenStatus> {
        Ok(TokenStatus::invalid())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    events: Arc<Mutex<Vec<(bool, String)>>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, ok: bool, message: &str) {
        self.events.lock().unwrap().push((ok, message.to_string()));
    }
}

fn coordinator<R: RemoteSource>(
    remote: R,
    dir: &tempfile::TempDir,
) -> (RunCoordinator<R, MemoryStore>, RecordingNotifier) {
    let notifier = RecordingNotifier::default();
    let coordinator = RunCoordinator::new(
        remote,
        MemoryStore::new(),
        MirrorState::default(),
        dir.path().join("state.json"),
        Box::new(ValidToken),
        Box::new(notifier.clone()),
    );
    (coordinator, notifier)
}

#[tokio::test]
async fn test_pull_scenario_create_rename_delete() {
    let dir = tempfile::tempdir().unwrap();

    // A(1) -> B(2) with item X in B, pulled four times: initial, unchanged,
    // B renamed to B2, then A deleted entirely.
    let initial = || {
        forest(
            vec![node(1, "A", None), node(2, "B", Some(1))],
            vec![item(10, "X", "http://x.com", 2)],
        )
    };
    let renamed = forest(
        vec![node(1, "A", None), node(2, "B2", Some(1))],
        vec![item(10, "X", "http://x.com", 2)],
    );
    let remote = ScriptedRemote::new(vec![
        Ok(initial()),
        Ok(initial()),
        Ok(renamed),
        Ok(forest(vec![], vec![])),
    ]);
    let (coordinator, _) = coordinator(remote, &dir);

    // First pull builds Root/A/B/X
    let stats = coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    assert_eq!(stats.folders_created, 2);
    assert_eq!(stats.bookmarks_created, 1);

    let (b_local, x_local) = coordinator
        .inspect(|store, state| {
            let root = state.identity.root_folder_id.clone().unwrap();
            let a = state.identity.collection(1).unwrap().clone();
            let b = state.identity.collection(2).unwrap().clone();
            let x = state.identity.item(10).unwrap().clone();
            assert_eq!(store.get_folder(&a).unwrap().parent_id.as_deref(), Some(root.as_str()));
            assert_eq!(store.get_folder(&b).unwrap().parent_id.as_deref(), Some(a.as_str()));
            assert_eq!(store.get_bookmark(&x).unwrap().parent_id.as_deref(), Some(b.as_str()));
            (b, x)
        })
        .await;

    // Second pull with no remote changes is a no-op
    let stats = coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    assert!(stats.is_empty());

    // Rename B -> B2 happens in place, identities untouched
    let stats = coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    assert_eq!(stats.folders_created, 0);
    assert_eq!(stats.bookmarks_created, 0);
    coordinator
        .inspect(|store, state| {
            assert_eq!(state.identity.collection(2).unwrap(), &b_local);
            assert_eq!(state.identity.item(10).unwrap(), &x_local);
            assert_eq!(store.get_folder(&b_local).unwrap().title, "B2");
        })
        .await;

    // Deleting collection A removes both folders and the bookmark
    let stats = coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    assert_eq!(stats.folders_removed, 2);
    assert_eq!(stats.bookmarks_deleted, 1);
}

#[tokio::test]
async fn test_auth_required_means_zero_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = RecordingNotifier::default();
    let coordinator = RunCoordinator::new(
        ScriptedRemote::new(vec![]),
        MemoryStore::new(),
        MirrorState::default(),
        dir.path().join("state.json"),
        Box::new(NoToken),
        Box::new(notifier.clone()),
    );

    let result = coordinator.run_mirror_pull(Trigger::Manual).await;
    assert!(matches!(result, Err(SyncError::AuthRequired)));

    coordinator
        .inspect(|_, state| {
            assert!(state.identity.is_empty());
            assert!(state.last_pulled_at.is_none());
        })
        .await;

    let events = notifier.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(!events[0].0);
}

#[tokio::test]
async fn test_fetch_error_aborts_before_any_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let remote = ScriptedRemote::new(vec![Err(FetchError::Status {
        endpoint: "/collections".to_string(),
        status: 500,
    })]);
    let (coordinator, _) = coordinator(remote, &dir);

    let result = coordinator.run_mirror_pull(Trigger::Manual).await;
    assert!(matches!(result, Err(SyncError::Fetch(_))));

    coordinator
        .inspect(|_, state| {
            assert!(state.identity.is_empty());
            assert!(state.last_pulled_at.is_none());
        })
        .await;
}

#[tokio::test]
async fn test_concurrent_pull_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let remote = BlockingRemote {
        started: started.clone(),
        release: release.clone(),
    };
    let (coordinator, _) = coordinator(remote, &dir);
    let coordinator = Arc::new(coordinator);

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_mirror_pull(Trigger::Manual).await })
    };
    started.notified().await;

    // Second trigger while the first holds the latch
    let second = coordinator.run_mirror_pull(Trigger::Alarm).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));

    // The rejected call touched nothing
    coordinator
        .inspect(|_, state| assert!(state.identity.is_empty()))
        .await;

    // The blocked run completes normally once released, proving the
    // rejected trigger did not cancel it.
    release.notify_one();
    let stats = first.await.unwrap().unwrap();
    assert_eq!(stats.folders_created, 1);
}

#[tokio::test]
async fn test_alarm_with_no_changes_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let f = || forest(vec![node(1, "A", None)], vec![]);
    let remote = ScriptedRemote::new(vec![Ok(f()), Ok(f())]);
    let (coordinator, notifier) = coordinator(remote, &dir);

    coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    let first_pull_time = coordinator
        .inspect(|_, state| state.last_pulled_at.unwrap())
        .await;

    let stats = coordinator.run_mirror_pull(Trigger::Alarm).await.unwrap();
    assert!(stats.is_empty());

    // Only the manual pull notified; the quiet alarm still advanced the
    // pull timestamp.
    let events = notifier.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].0);

    let second_pull_time = coordinator
        .inspect(|_, state| state.last_pulled_at.unwrap())
        .await;
    assert!(second_pull_time >= first_pull_time);
}

#[tokio::test]
async fn test_reset_rebuilds_with_fresh_identities() {
    let dir = tempfile::tempdir().unwrap();
    let f = || {
        forest(
            vec![node(1, "A", None)],
            vec![item(10, "X", "http://x.com", 1)],
        )
    };
    let remote = ScriptedRemote::new(vec![Ok(f()), Ok(f())]);
    let (coordinator, _) = coordinator(remote, &dir);

    coordinator.run_mirror_pull(Trigger::Manual).await.unwrap();
    let old_folder = coordinator
        .inspect(|_, state| state.identity.collection(1).unwrap().clone())
        .await;

    let stats = coordinator.run_mirror_pull(Trigger::Reset).await.unwrap();
    assert_eq!(stats.folders_created, 1);
    assert_eq!(stats.bookmarks_created, 1);

    coordinator
        .inspect(|store, state| {
            let new_folder = state.identity.collection(1).unwrap().clone();
            assert_ne!(new_folder, old_folder);
            assert!(store.get_folder(&old_folder).is_none());
            assert!(store.get_folder(&new_folder).is_some());
        })
        .await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let f = || {
        forest(
            vec![node(1, "A", None)],
            vec![item(10, "X", "http://x.com", 1)],
        )
    };

    let remote = ScriptedRemote::new(vec![Ok(f())]);
    let (first, _) = coordinator(remote, &dir);
    first.run_mirror_pull(Trigger::Manual).await.unwrap();

    // A fresh process loads the persisted identity map and recognizes
    // everything instead of re-creating it across pulls.
    let live = first.inspect(|_, state| state.clone()).await;
    let reloaded = MirrorState::load(&dir.path().join("state.json")).unwrap();
    assert_eq!(reloaded.identity.collection(1), live.identity.collection(1));
    assert_eq!(reloaded.identity.item(10), live.identity.item(10));
    assert!(reloaded.last_pulled_at.is_some());
}
