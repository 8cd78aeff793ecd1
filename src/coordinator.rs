use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::TokenValidator;
use crate::error::SyncError;
use crate::local_store::LocalStore;
use crate::notify::Notifier;
use crate::reconciler::{MirrorStats, Reconciler};
use crate::remote::RemoteSource;
use crate::state::MirrorState;

/// Event source that initiated a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Alarm,
    Reset,
    Command,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Alarm => "alarm",
            Trigger::Reset => "reset",
            Trigger::Command => "command",
        }
    }
}

struct Inner<R, S> {
    remote: R,
    store: S,
    state: MirrorState,
    state_path: PathBuf,
}

/// Owns the single "pull in progress" latch and funnels every trigger
/// surface through [`RunCoordinator::run_mirror_pull`]. The latch is
/// process-lifetime only; a fresh process starts unlatched.
pub struct RunCoordinator<R: RemoteSource, S: LocalStore> {
    inner: Mutex<Inner<R, S>>,
    in_flight: AtomicBool,
    token: Box<dyn TokenValidator>,
    notifier: Box<dyn Notifier>,
}

/// Releases the latch on every exit path, panics included.
struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteSource, S: LocalStore> RunCoordinator<R, S> {
    pub fn new(
        remote: R,
        store: S,
        state: MirrorState,
        state_path: PathBuf,
        token: Box<dyn TokenValidator>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                remote,
                store,
                state,
                state_path,
            }),
            in_flight: AtomicBool::new(false),
            token,
            notifier,
        }
    }

    /// Runs one mirror pull. At most one run is ever in flight; a second
    /// call while the latch is held is rejected without touching the local
    /// tree. A superseded run is never cancelled, the new trigger simply
    /// loses.
    pub async fn run_mirror_pull(&self, trigger: Trigger) -> Result<MirrorStats, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Pull rejected, another run holds the latch");
            return Err(SyncError::AlreadyRunning);
        }
        let _latch = LatchGuard(&self.in_flight);

        info!("🔄 Mirror pull started (trigger: {})", trigger.name());
        let result = self.run_locked(trigger).await;

        match &result {
            Ok(stats) => {
                info!("✅ Mirror pull complete: {}", stats.summary());
                // Alarm runs that changed nothing stay quiet
                if trigger != Trigger::Alarm || !stats.is_empty() {
                    self.notifier.notify(true, &stats.summary());
                }
            }
            Err(e) => {
                error!("❌ Mirror pull failed: {}", e);
                self.notifier.notify(false, &e.to_string());
            }
        }
        result
    }

    async fn run_locked(&self, trigger: Trigger) -> Result<MirrorStats, SyncError> {
        let status = self.token.validate().map_err(|e| {
            warn!("⚠️  Token validation errored: {}", e);
            SyncError::AuthRequired
        })?;
        if !status.is_valid {
            return Err(SyncError::AuthRequired);
        }

        let mut guard = self.inner.lock().await;
        let Inner {
            remote,
            store,
            state,
            state_path,
        } = &mut *guard;

        if trigger == Trigger::Reset {
            reset_mirror(store, state, state_path)?;
        }

        // The reconciler never sees a partial fetch; any remote error
        // aborts here with zero local mutation.
        let forest = remote.fetch_remote_tree().await?;

        let result = Reconciler::new(store, state).reconcile(&forest);

        if result.is_ok() {
            state.last_pulled_at = Some(Utc::now());
        }
        // Identity entries may have changed even on a partial failure, so
        // the state is persisted either way.
        if let Err(e) = state.save(state_path) {
            warn!("⚠️  Failed to persist mirror state: {}", e);
            if result.is_ok() {
                return Err(SyncError::State(e.to_string()));
            }
        }
        result
    }

    /// Read-only access to the engine's store and state, for status and
    /// tree inspection commands and for tests.
    pub async fn inspect<T>(&self, f: impl FnOnce(&S, &MirrorState) -> T) -> T {
        let guard = self.inner.lock().await;
        f(&guard.store, &guard.state)
    }
}

/// "Reset & Re-pull": drop the mirrored subtree and all mappings, keep the
/// root-placement settings, then let the caller run a first pull.
fn reset_mirror<S: LocalStore>(
    store: &mut S,
    state: &mut MirrorState,
    state_path: &PathBuf,
) -> Result<(), SyncError> {
    if let Some(root_id) = state.identity.root_folder_id.clone() {
        if store.get_folder(&root_id).is_some() {
            store.remove(&root_id).map_err(|source| SyncError::LocalStore {
                source,
                partial: MirrorStats::default(),
            })?;
        }
    }
    state.identity.clear();
    state.last_pulled_at = None;
    state
        .save(state_path)
        .map_err(|e| SyncError::State(e.to_string()))?;
    info!("🗑️  Mirror state cleared, re-pulling from scratch");
    Ok(())
}
