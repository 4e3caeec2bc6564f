//! Ordered-candidate protocol shared by elections and locks
//!
//! Every contender for a path creates a unique key under it, attached to
//! its session lease. The store's creation revision orders the keys: the
//! lowest live revision holds the path. A waiter only watches the key right
//! before its own, so one release wakes exactly one waiter.
//!
//! ```text
//! /election/payments/
//!     694d00000001-4f1c...   rev 17   <- holder
//!     694d00000002-9a03...   rev 21   watches rev 17
//!     694d00000003-c2e8...   rev 22   watches rev 21
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::metrics::{SyncMetrics, result_label};
use crate::session::{Session, SessionState};
use crate::store::{CoordinationStore, KeyValue, LeaseId, Revision, WatchEvent};

const MONITOR_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MONITOR_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Holder state of an acquired candidate key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HolderState {
    Holding,
    /// A resign is in flight. `lost` records a loss seen meanwhile, which is
    /// delivered if the delete fails.
    Releasing { lost: bool },
    /// The key disappeared without the owner resigning.
    Lost,
    Resigned,
    /// The handle was closed locally.
    Closed,
}

/// Observer of a held key's status.
///
/// Yields nothing while the key is held. Delivers `Some(false)` exactly once
/// when holder status is lost for any reason other than the owner's own
/// resign or close, then `None` forever.
pub struct Status {
    rx: watch::Receiver<HolderState>,
    done: bool,
}

impl Status {
    pub(crate) fn new(rx: watch::Receiver<HolderState>) -> Self {
        Self { rx, done: false }
    }

    /// Wait for the loss signal.
    ///
    /// Returns `Some(false)` once on loss, `None` after a resign, close, or
    /// an already delivered signal.
    pub async fn recv(&mut self) -> Option<bool> {
        loop {
            if let Some(signal) = self.poll_state() {
                return signal;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped: take its final state into account.
                return self.poll_state().unwrap_or_else(|| {
                    self.done = true;
                    None
                });
            }
        }
    }

    /// Non-blocking variant of [`Status::recv`]: `Some(false)` if the loss
    /// happened and was not delivered yet, otherwise `None`.
    pub fn try_recv(&mut self) -> Option<bool> {
        self.poll_state().flatten()
    }

    /// `None` while holding, `Some(signal)` once the state is terminal.
    fn poll_state(&mut self) -> Option<Option<bool>> {
        if self.done {
            return Some(None);
        }
        let state = *self.rx.borrow_and_update();
        match state {
            HolderState::Holding | HolderState::Releasing { .. } => None,
            HolderState::Lost => {
                self.done = true;
                Some(Some(false))
            }
            HolderState::Resigned | HolderState::Closed => {
                self.done = true;
                Some(None)
            }
        }
    }
}

/// Whether the acquire call waits for its turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcquireMode {
    Wait,
    Try,
}

pub(crate) struct CandidateRequest<'a> {
    pub kind: &'static str,
    pub path: &'a str,
    pub value: &'a [u8],
    pub mode: AcquireMode,
}

/// Key prefix shared by every candidate of `path`.
pub(crate) fn candidate_prefix(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(SyncError::InvalidConfig("path must not be empty".to_string()));
    }
    Ok(format!("{}/", path.trim_end_matches('/')))
}

fn candidate_key(prefix: &str, lease: LeaseId) -> String {
    format!("{}{:x}-{}", prefix, lease, Uuid::new_v4().simple())
}

/// Current holder of `path`, if any.
pub(crate) async fn current_holder(
    store: &Arc<dyn CoordinationStore>,
    path: &str,
) -> Result<Option<KeyValue>> {
    let prefix = candidate_prefix(path)?;
    Ok(store.get_prefix(&prefix).await?.into_iter().next())
}

/// Deletes a candidate key when an acquire future is dropped mid-wait.
///
/// Armed before the create call: without a revision the key is deleted
/// unconditionally, which is safe because its name carries a fresh nonce.
/// A create still in flight on the server when the delete lands leaves the
/// key to lease expiry.
struct CleanupGuard {
    store: Option<Arc<dyn CoordinationStore>>,
    key: String,
    revision: Option<Revision>,
}

impl CleanupGuard {
    fn disarm(mut self) {
        self.store = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let revision = self.revision;
        runtime.spawn(async move {
            let removed = match revision {
                Some(revision) => store.delete_if_created(&key, revision).await,
                None => store.delete(&key).await,
            };
            match removed {
                Ok(_) => debug!(key = %key, "abandoned candidate removed"),
                Err(e) => warn!(key = %key, error = %e, "failed to remove abandoned candidate"),
            }
        });
    }
}

async fn remove_candidate(store: &Arc<dyn CoordinationStore>, key: &str, revision: Revision) {
    if let Err(e) = store.delete_if_created(key, revision).await {
        warn!(key = %key, error = %e, "failed to remove candidate key, lease expiry will");
    }
}

fn session_lost(rx: &watch::Receiver<SessionState>, lease: LeaseId) -> bool {
    !matches!(*rx.borrow(), SessionState::Alive(current) if current == lease)
}

/// Create a candidate key for `request.path` and wait until it holds the
/// path.
///
/// On any failure, including cancellation, the key is deleted before
/// returning.
pub(crate) async fn acquire(
    ctx: &Context,
    store: &Arc<dyn CoordinationStore>,
    session: &Session,
    metrics: &Arc<SyncMetrics>,
    request: CandidateRequest<'_>,
) -> Result<Holder> {
    let started = std::time::Instant::now();
    let result = acquire_inner(ctx, store, session, metrics, &request).await;
    match &result {
        Ok(_) => metrics.record_acquire(request.kind, "success", started),
        Err(e) => metrics.record_acquire(request.kind, result_label(e), started),
    }
    result
}

async fn acquire_inner(
    ctx: &Context,
    store: &Arc<dyn CoordinationStore>,
    session: &Session,
    metrics: &Arc<SyncMetrics>,
    request: &CandidateRequest<'_>,
) -> Result<Holder> {
    if let Some(reason) = ctx.err() {
        return Err(SyncError::Cancelled(reason));
    }

    let prefix = candidate_prefix(request.path)?;
    let lease = session.lease_id()?;
    let key = candidate_key(&prefix, lease);

    let mut guard = CleanupGuard {
        store: Some(store.clone()),
        key: key.clone(),
        revision: None,
    };
    let Some(created) = store.create(&key, request.value, lease).await? else {
        guard.disarm();
        return Err(SyncError::Transport(format!(
            "candidate key '{}' already exists",
            key
        )));
    };
    let revision = created.create_revision;
    guard.revision = Some(revision);
    debug!(kind = request.kind, key = %key, revision, "candidate created");

    let mut session_rx = session.subscribe();
    let waited = wait_for_turn(
        ctx,
        store,
        &mut session_rx,
        &prefix,
        &key,
        lease,
        request.mode,
    )
    .await;
    guard.disarm();

    if let Err(e) = waited {
        if !matches!(e, SyncError::Locked(_)) {
            debug!(kind = request.kind, key = %key, error = %e, "candidate gave up");
        }
        remove_candidate(store, &key, revision).await;
        return Err(match e {
            SyncError::Locked(_) => SyncError::Locked(request.path.to_string()),
            other => other,
        });
    }

    info!(kind = request.kind, path = %request.path, key = %key, revision, "acquired");

    Ok(Holder::start(
        request.kind,
        request.path.to_string(),
        key,
        revision,
        lease,
        store.clone(),
        session_rx,
        metrics.clone(),
    ))
}

async fn wait_for_turn(
    ctx: &Context,
    store: &Arc<dyn CoordinationStore>,
    session_rx: &mut watch::Receiver<SessionState>,
    prefix: &str,
    key: &str,
    lease: LeaseId,
    mode: AcquireMode,
) -> Result<()> {
    loop {
        if session_lost(session_rx, lease) {
            return Err(SyncError::LeaseExpired(lease));
        }

        let candidates = store.get_prefix(prefix).await?;
        let Some(position) = candidates.iter().position(|kv| kv.key == key) else {
            return Err(SyncError::Transport(format!(
                "candidate key '{}' vanished while waiting",
                key
            )));
        };
        if position == 0 {
            return Ok(());
        }
        if mode == AcquireMode::Try {
            return Err(SyncError::Locked(prefix.to_string()));
        }

        let predecessor = &candidates[position - 1];
        let mut events = store.watch(&predecessor.key).await?;

        // The predecessor may have left between the read and the watch.
        match store.get(&predecessor.key).await? {
            Some(kv) if kv.create_revision == predecessor.create_revision => {}
            _ => continue,
        }
        debug!(key = %key, predecessor = %predecessor.key, "waiting for predecessor");

        loop {
            tokio::select! {
                reason = ctx.done() => return Err(SyncError::Cancelled(reason)),
                event = events.next() => match event {
                    Some(Ok(WatchEvent::Delete { .. })) => break,
                    Some(Ok(WatchEvent::Put(_))) => continue,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(SyncError::Connection("predecessor watch closed".to_string()));
                    }
                },
                changed = session_rx.changed() => {
                    if changed.is_err() || session_lost(session_rx, lease) {
                        return Err(SyncError::LeaseExpired(lease));
                    }
                }
            }
        }
    }
}

/// A held candidate key: the shared core of `Leader` and `Mutex`.
pub(crate) struct Holder {
    kind: &'static str,
    path: String,
    key: String,
    revision: Revision,
    lease: LeaseId,
    store: Arc<dyn CoordinationStore>,
    state_tx: Arc<watch::Sender<HolderState>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<SyncMetrics>,
}

impl Holder {
    #[allow(clippy::too_many_arguments)]
    fn start(
        kind: &'static str,
        path: String,
        key: String,
        revision: Revision,
        lease: LeaseId,
        store: Arc<dyn CoordinationStore>,
        session_rx: watch::Receiver<SessionState>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(HolderState::Holding);
        let state_tx = Arc::new(state_tx);

        let monitor = HolderMonitor {
            kind,
            key: key.clone(),
            revision,
            lease,
            store: store.clone(),
            state_tx: state_tx.clone(),
            metrics: metrics.clone(),
        };
        let task = tokio::spawn(monitor.run(session_rx));

        Self {
            kind,
            path,
            key,
            revision,
            lease,
            store,
            state_tx,
            monitor: Mutex::new(Some(task)),
            metrics,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn revision(&self) -> Revision {
        self.revision
    }

    pub(crate) fn lease_id(&self) -> LeaseId {
        self.lease
    }

    pub(crate) fn is_holding(&self) -> bool {
        *self.state_tx.borrow() == HolderState::Holding
    }

    pub(crate) fn status(&self) -> Status {
        Status::new(self.state_tx.subscribe())
    }

    fn stop_monitor(&self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
    }

    /// Leave `Releasing` for the state `next` picks from the recorded loss.
    /// `None` if the handle was closed meanwhile.
    fn finish_release(&self, next: impl FnOnce(bool) -> HolderState) -> Option<HolderState> {
        let mut entered = None;
        self.state_tx.send_if_modified(|state| match *state {
            HolderState::Releasing { lost } => {
                *state = next(lost);
                entered = Some(*state);
                true
            }
            _ => false,
        });
        entered
    }

    fn report_lost(&self, reason: &str) {
        self.metrics.record_holder_lost(self.kind);
        warn!(kind = self.kind, key = %self.key, reason, "holder status lost");
    }

    /// Delete the key if it is still held. A successful release does not
    /// signal the observers.
    ///
    /// If the delete fails the handle keeps holding, unless the key was
    /// lost meanwhile. A key found already gone is reported as lost.
    pub(crate) async fn release(&self, ctx: &Context) -> Result<()> {
        if let Some(reason) = ctx.err() {
            return Err(SyncError::Cancelled(reason));
        }

        let releasing = self.state_tx.send_if_modified(|state| {
            if *state == HolderState::Holding {
                *state = HolderState::Releasing { lost: false };
                true
            } else {
                false
            }
        });
        if !releasing {
            return Err(SyncError::NotHeld(self.key.clone()));
        }

        match self.store.delete_if_created(&self.key, self.revision).await {
            Ok(true) => {
                self.stop_monitor();
                self.finish_release(|_| HolderState::Resigned);
                info!(kind = self.kind, path = %self.path, key = %self.key, "released");
                Ok(())
            }
            Ok(false) => {
                // Gone before the monitor noticed: expired or deleted by others.
                self.stop_monitor();
                if self.finish_release(|_| HolderState::Lost).is_some() {
                    self.report_lost("key already gone on release");
                }
                Err(SyncError::NotHeld(self.key.clone()))
            }
            Err(e) => {
                let next = self.finish_release(|lost| {
                    if lost {
                        HolderState::Lost
                    } else {
                        HolderState::Holding
                    }
                });
                if next == Some(HolderState::Lost) {
                    self.report_lost("key lost during failed release");
                } else {
                    warn!(kind = self.kind, key = %self.key, error = %e, "release failed, still holding");
                }
                Err(e)
            }
        }
    }

    /// Stop watching the key. The key itself stays until released or its
    /// lease ends.
    pub(crate) fn close(&self) {
        self.stop_monitor();
        self.state_tx.send_if_modified(|state| {
            if matches!(*state, HolderState::Holding | HolderState::Releasing { .. }) {
                *state = HolderState::Closed;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

/// Background watch turning key loss into a status signal.
struct HolderMonitor {
    kind: &'static str,
    key: String,
    revision: Revision,
    lease: LeaseId,
    store: Arc<dyn CoordinationStore>,
    state_tx: Arc<watch::Sender<HolderState>>,
    metrics: Arc<SyncMetrics>,
}

impl HolderMonitor {
    async fn run(self, mut session_rx: watch::Receiver<SessionState>) {
        let mut backoff = MONITOR_INITIAL_BACKOFF;

        loop {
            if session_lost(&session_rx, self.lease) {
                self.mark_lost("session lease lost");
                return;
            }

            let mut events = match self.store.watch(&self.key).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "holder watch failed");
                    if !self.pause(&mut session_rx, &mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            match self.store.get(&self.key).await {
                Ok(Some(kv)) if kv.create_revision == self.revision => {}
                Ok(_) => {
                    self.mark_lost("key deleted");
                    return;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "holder check failed");
                    if !self.pause(&mut session_rx, &mut backoff).await {
                        return;
                    }
                    continue;
                }
            }
            backoff = MONITOR_INITIAL_BACKOFF;

            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(WatchEvent::Delete { .. })) => {
                            self.mark_lost("key deleted");
                            return;
                        }
                        Some(Ok(WatchEvent::Put(_))) => {}
                        Some(Err(e)) => {
                            debug!(key = %self.key, error = %e, "holder watch broken, re-establishing");
                            break;
                        }
                        None => break,
                    },
                    changed = session_rx.changed() => {
                        if changed.is_err() || session_lost(&session_rx, self.lease) {
                            self.mark_lost("session lease lost");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleep before retrying; false if the session went away meanwhile.
    async fn pause(
        &self,
        session_rx: &mut watch::Receiver<SessionState>,
        backoff: &mut Duration,
    ) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(MONITOR_MAX_BACKOFF);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = session_rx.changed() => {
                if changed.is_err() || session_lost(session_rx, self.lease) {
                    self.mark_lost("session lease lost");
                    false
                } else {
                    true
                }
            }
        }
    }

    fn mark_lost(&self, reason: &str) {
        let lost = self.state_tx.send_if_modified(|state| match *state {
            HolderState::Holding => {
                *state = HolderState::Lost;
                true
            }
            HolderState::Releasing { lost: false } => {
                // Observers wait for the release outcome.
                *state = HolderState::Releasing { lost: true };
                false
            }
            _ => false,
        });
        if lost {
            self.metrics.record_holder_lost(self.kind);
            warn!(kind = self.kind, key = %self.key, reason, "holder status lost");
        } else {
            debug!(kind = self.kind, key = %self.key, reason, "holder monitor stopped");
        }
    }
}
