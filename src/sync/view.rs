//! Live view handle and the task behind it

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{HubInner, SnapshotData, ViewState, ViewTarget};
use crate::store::ChangeEvent;
use crate::types::{BeaconError, Result};

/// Scoped subscription to a document or collection.
///
/// The watch is attached while this handle lives. Dropping it aborts the
/// backing task, so no snapshot is produced for it afterwards; a state
/// already sitting in the channel may still be read once.
pub struct LiveView {
    state_rx: watch::Receiver<ViewState>,
    target_tx: watch::Sender<Option<ViewTarget>>,
    task: JoinHandle<()>,
}

impl LiveView {
    pub(super) fn spawn(hub: Arc<HubInner>, target: Option<ViewTarget>) -> Self {
        let initial = match &target {
            None => ViewState::idle(0),
            Some(_) => ViewState::loading(None, 0),
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (target_tx, target_rx) = watch::channel(target);

        // Subscribe before the first query so no commit slips between them
        let changes = hub.store.subscribe();
        let task = tokio::spawn(run_view(hub, target_rx, state_tx, changes));

        Self {
            state_rx,
            target_tx,
            task,
        }
    }

    /// Latest published state
    pub fn state(&self) -> ViewState {
        self.state_rx.borrow().clone()
    }

    pub fn target(&self) -> Option<ViewTarget> {
        self.target_tx.borrow().clone()
    }

    /// Follow a different target. An equivalent target is a no-op.
    pub fn retarget(&self, target: Option<ViewTarget>) {
        self.target_tx.send_if_modified(|current| {
            if *current == target {
                false
            } else {
                *current = target;
                true
            }
        });
    }

    /// Wait for the next published state
    pub async fn changed(&mut self) -> Result<ViewState> {
        self.state_rx
            .changed()
            .await
            .map_err(|_| BeaconError::Internal("live view task ended".into()))?;
        Ok(self.state_rx.borrow_and_update().clone())
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(&mut self, predicate: impl FnMut(&ViewState) -> bool) -> Result<ViewState> {
        self.state_rx
            .wait_for(predicate)
            .await
            .map(|state| state.clone())
            .map_err(|_| BeaconError::Internal("live view task ended".into()))
    }

    /// A second receiver on the same state channel
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state_rx.clone()
    }

    /// Detach the watch and wait until the task is gone
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds a watch attachment for as long as the task follows one target.
/// Released on retarget and when the task is aborted.
struct Attachment {
    hub: Arc<HubInner>,
    key: String,
}

impl Attachment {
    fn new(hub: &Arc<HubInner>, key: String) -> Self {
        hub.attach(&key);
        Self {
            hub: Arc::clone(hub),
            key,
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.hub.detach(&self.key);
    }
}

enum Exit {
    Retarget,
    Closed,
}

async fn run_view(
    hub: Arc<HubInner>,
    mut target_rx: watch::Receiver<Option<ViewTarget>>,
    state_tx: watch::Sender<ViewState>,
    mut changes: broadcast::Receiver<ChangeEvent>,
) {
    let mut last_seq = 0u64;

    loop {
        let target = target_rx.borrow_and_update().clone();
        let exit = match target {
            None => {
                state_tx.send_replace(ViewState::idle(last_seq));
                match target_rx.changed().await {
                    Ok(()) => Exit::Retarget,
                    Err(_) => Exit::Closed,
                }
            }
            Some(target) => {
                follow(
                    &hub,
                    &target,
                    &mut target_rx,
                    &mut changes,
                    &state_tx,
                    &mut last_seq,
                )
                .await
            }
        };

        if let Exit::Closed = exit {
            break;
        }
    }
    debug!("Live view task finished");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Keep one target's snapshot current until retargeted or closed
async fn follow(
    hub: &Arc<HubInner>,
    target: &ViewTarget,
    target_rx: &mut watch::Receiver<Option<ViewTarget>>,
    changes: &mut broadcast::Receiver<ChangeEvent>,
    state_tx: &watch::Sender<ViewState>,
    last_seq: &mut u64,
) -> Exit {
    let key = target.cache_key();
    let _attachment = Attachment::new(hub, key.clone());

    // A cached snapshot can be shown at once, but stays loading until the
    // re-attached watch confirms it
    let mut current: Option<SnapshotData> = match hub.cache.get(&key) {
        Some(cached) if cached.seq >= *last_seq => {
            *last_seq = cached.seq;
            Some(cached.data.clone())
        }
        _ => None,
    };
    state_tx.send_replace(ViewState::loading(current.clone(), *last_seq));

    let mut needs_query = true;
    let mut retry_at: Option<Instant> = None;

    loop {
        if needs_query {
            needs_query = false;
            match hub.snapshot(target).await {
                Ok(snapshot) if snapshot.seq >= *last_seq => {
                    retry_at = None;
                    *last_seq = snapshot.seq;
                    hub.remember(&key, &snapshot);
                    current = Some(snapshot.data.clone());
                    debug!(target_key = %key, seq = snapshot.seq, "Snapshot delivered");
                    state_tx.send_replace(ViewState::ready(snapshot));
                }
                Ok(snapshot) => {
                    // Older than what was shown; a newer commit is on its way
                    retry_at = None;
                    debug!(target_key = %key, seq = snapshot.seq, last_seq = *last_seq, "Discarding older snapshot");
                }
                Err(e) => {
                    warn!(target_key = %key, error = %e, "Snapshot query failed, keeping last known data");
                    state_tx.send_replace(ViewState::degraded(current.clone(), *last_seq, e.to_string()));
                    retry_at = Some(Instant::now() + hub.retry);
                }
            }
        }

        tokio::select! {
            changed = target_rx.changed() => {
                return match changed {
                    Ok(()) => Exit::Retarget,
                    Err(_) => Exit::Closed,
                };
            }
            event = changes.recv() => {
                match event {
                    Ok(event) => {
                        if target.matches(&event) {
                            needs_query = true;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(target_key = %key, skipped = n, "Change stream lagged, re-querying");
                        needs_query = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(target_key = %key, "Store change stream closed");
                        return Exit::Closed;
                    }
                }
            }
            _ = wait_until(retry_at) => {
                needs_query = true;
            }
        }
    }
}
