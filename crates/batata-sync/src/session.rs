//! Lease-backed session with heartbeat
//!
//! A session owns one store lease and a background task renewing it every
//! heartbeat interval. Every candidate key created through a [`crate::Sync`]
//! is attached to the session lease, so when the process dies or is
//! partitioned for longer than the TTL the store deletes all of them.
//!
//! When the lease is found gone the session publishes
//! [`SessionState::Expired`], grants a fresh lease with exponential backoff
//! and publishes [`SessionState::Alive`] again. Handles created under the old
//! lease observe the expiry and report status loss.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::store::{CoordinationStore, LeaseId};

/// First retry delay when re-granting an expired lease.
const RECOVERY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Lease state published by the heartbeat task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The lease is held and renewed.
    Alive(LeaseId),
    /// The lease is gone; a new one is being granted.
    Expired(LeaseId),
    /// The session was closed.
    Closed,
}

impl SessionState {
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            SessionState::Alive(id) | SessionState::Expired(id) => Some(*id),
            SessionState::Closed => None,
        }
    }
}

/// Lease-backed liveness token for one `Sync`.
pub struct Session {
    store: Arc<dyn CoordinationStore>,
    state_tx: Arc<watch::Sender<SessionState>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Grant the lease and start the heartbeat task.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        ttl: Duration,
        heartbeat_interval: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let lease = store.grant_lease(ttl_secs).await?;
        info!(lease = %format!("{:x}", lease), ttl_secs, "session lease granted");

        let (state_tx, _) = watch::channel(SessionState::Alive(lease));
        let state_tx = Arc::new(state_tx);
        let (stop_tx, stop_rx) = watch::channel(false);

        let heartbeat = Heartbeat {
            store: store.clone(),
            state_tx: state_tx.clone(),
            ttl,
            ttl_secs,
            interval: heartbeat_interval,
            metrics,
        };
        let task = tokio::spawn(heartbeat.run(lease, stop_rx));

        Ok(Self {
            store,
            state_tx,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Lease that new keys must be attached to.
    pub fn lease_id(&self) -> Result<LeaseId> {
        match self.state() {
            SessionState::Alive(id) => Ok(id),
            SessionState::Expired(id) => Err(SyncError::LeaseExpired(id)),
            SessionState::Closed => Err(SyncError::Closed),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Stop the heartbeat and revoke the lease. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        let _ = self.stop_tx.send(true);
        task.abort();

        let lease = self.state().lease_id();
        self.state_tx.send_replace(SessionState::Closed);

        let Some(lease) = lease else {
            return Ok(());
        };
        match self.store.revoke_lease(lease).await {
            Ok(()) => {
                info!(lease = %format!("{:x}", lease), "session lease revoked");
                Ok(())
            }
            Err(SyncError::LeaseExpired(_)) => Ok(()),
            Err(e) => {
                warn!(lease = %format!("{:x}", lease), error = %e, "failed to revoke session lease");
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Heartbeat {
    store: Arc<dyn CoordinationStore>,
    state_tx: Arc<watch::Sender<SessionState>>,
    ttl: Duration,
    ttl_secs: i64,
    interval: Duration,
    metrics: Arc<SyncMetrics>,
}

impl Heartbeat {
    async fn run(self, mut lease: LeaseId, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the lease is fresh.
        interval.tick().await;

        let mut last_confirmed = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => break,
            }

            let expired = match self.store.keep_alive(lease).await {
                Ok(_) => {
                    last_confirmed = Instant::now();
                    false
                }
                Err(SyncError::LeaseExpired(_)) => true,
                Err(e) => {
                    self.metrics.record_heartbeat_failure();
                    if e.is_retryable() {
                        warn!(lease = %format!("{:x}", lease), error = %e, "session heartbeat failed");
                    } else {
                        error!(lease = %format!("{:x}", lease), error = %e, "session heartbeat rejected");
                    }
                    last_confirmed.elapsed() >= self.ttl
                }
            };

            if !expired {
                continue;
            }

            error!(lease = %format!("{:x}", lease), "session lease lost");
            self.state_tx.send_replace(SessionState::Expired(lease));

            let Some(fresh) = self.recover(&mut stop_rx).await else {
                break;
            };

            // Keys of a lease that was only presumed dead must not linger.
            if let Err(e) = self.store.revoke_lease(lease).await {
                debug!(lease = %format!("{:x}", lease), error = %e, "old lease already gone");
            }

            info!(
                old_lease = %format!("{:x}", lease),
                lease = %format!("{:x}", fresh),
                "session lease re-granted"
            );
            self.metrics.record_session_renewed();
            lease = fresh;
            last_confirmed = Instant::now();
            self.state_tx.send_replace(SessionState::Alive(lease));
        }

        debug!("session heartbeat stopped");
    }

    /// Grant a new lease, backing off between failures. `None` on stop.
    async fn recover(&self, stop_rx: &mut watch::Receiver<bool>) -> Option<LeaseId> {
        let mut backoff = RECOVERY_INITIAL_BACKOFF;
        loop {
            match self.store.grant_lease(self.ttl_secs).await {
                Ok(lease) => return Some(lease),
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "lease grant failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop_rx.changed() => return None,
            }
            backoff = (backoff * 2).min(self.ttl);
        }
    }
}
