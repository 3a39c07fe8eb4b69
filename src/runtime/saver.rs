//! Background queue persistence.
//!
//! A tokio task owns the adapter and writes the latest requested snapshot
//! once the debounce deadline passes, on flush, or on shutdown.

use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    config::SaverConfig,
    core::queue::{OfflineOperationQueue, QueueError},
    persist::{PersistError, PersistenceAdapter},
};

#[derive(Debug, thiserror::Error)]
pub enum SaverError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("saver task is gone")]
    ChannelClosed,
}

/// Outcome of one adapter write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveEvent {
    Saved {
        bytes: usize,
        /// Requests superseded by this write.
        coalesced: usize,
    },
    Failed {
        error: String,
    },
}

enum SaverMsg {
    Save {
        payload: String,
    },
    Flush {
        resp: oneshot::Sender<Result<bool, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
}

#[derive(Clone)]
pub struct SaverHandle {
    cmd_tx: mpsc::Sender<SaverMsg>,
    events_tx: broadcast::Sender<SaveEvent>,
}

/// Starts the saver task. Must be called inside a tokio runtime.
///
/// Requests arriving within `debounce_ms` of the first unsaved one are
/// coalesced and only the latest payload is written. Writes run on the
/// blocking pool; requests received meanwhile wait for the next round.
pub fn spawn_queue_saver(adapter: Box<dyn PersistenceAdapter>, config: SaverConfig) -> SaverHandle {
    let (cmd_tx, rx) = mpsc::channel::<SaverMsg>(config.queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<SaveEvent>(256);
    spawn_worker(adapter, rx, events_tx.clone(), config);
    SaverHandle { cmd_tx, events_tx }
}

impl SaverHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.events_tx.subscribe()
    }

    /// Schedules `payload` to be written; supersedes any unwritten request.
    pub async fn request_save(&self, payload: String) -> Result<(), SaverError> {
        self.cmd_tx
            .send(SaverMsg::Save { payload })
            .await
            .map_err(|_| SaverError::ChannelClosed)
    }

    /// Exports `queue` and schedules the result.
    pub async fn request_queue_save(&self, queue: &OfflineOperationQueue) -> Result<(), SaverError> {
        let payload = queue.export()?;
        self.request_save(payload).await
    }

    /// Writes the pending payload now. `Ok(false)` when nothing was pending.
    pub async fn flush(&self) -> Result<bool, SaverError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SaverMsg::Flush { resp: tx })
            .await
            .map_err(|_| SaverError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| SaverError::ChannelClosed)??)
    }

    /// Flushes and stops the task.
    pub async fn shutdown(&self) -> Result<(), SaverError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SaverMsg::Shutdown { resp: tx })
            .await
            .map_err(|_| SaverError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| SaverError::ChannelClosed)??)
    }
}

const MAX_BACKOFF_SHIFT: u32 = 6;

struct Pending {
    payload: Option<String>,
    coalesced: usize,
    /// Consecutive failed writes of the current payload.
    failures: u32,
}

impl Pending {
    fn timer_armed(&self, max_attempts: u32) -> bool {
        self.payload.is_some() && self.failures < max_attempts
    }
}

fn retry_delay(debounce: Duration, failures: u32) -> Duration {
    debounce.saturating_mul(1 << failures.min(MAX_BACKOFF_SHIFT))
}

fn spawn_worker(
    adapter: Box<dyn PersistenceAdapter>,
    mut rx: mpsc::Receiver<SaverMsg>,
    events_tx: broadcast::Sender<SaveEvent>,
    config: SaverConfig,
) {
    let adapter = Arc::new(Mutex::new(adapter));
    let key: Arc<str> = Arc::from(config.key.as_str());
    let debounce = Duration::from_millis(config.debounce_ms);
    let max_attempts = config.max_write_attempts.max(1);

    tokio::spawn(async move {
        let mut pending = Pending {
            payload: None,
            coalesced: 0,
            failures: 0,
        };
        let mut deadline = Instant::now() + debounce;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = write_pending(&adapter, &key, &mut pending, &events_tx).await;
                        break;
                    };

                    match msg {
                        SaverMsg::Save { payload } => {
                            if pending.payload.is_none() || pending.failures > 0 {
                                deadline = Instant::now() + debounce;
                            }
                            if pending.payload.is_some() {
                                pending.coalesced += 1;
                            }
                            pending.payload = Some(payload);
                            pending.failures = 0;
                        }
                        SaverMsg::Flush { resp } => {
                            let result = write_pending(&adapter, &key, &mut pending, &events_tx).await;
                            if result.is_ok() {
                                pending.failures = 0;
                            }
                            let _ = resp.send(result);
                            deadline = Instant::now() + debounce;
                        }
                        SaverMsg::Shutdown { resp } => {
                            let result = write_pending(&adapter, &key, &mut pending, &events_tx).await;
                            let _ = resp.send(result.map(|_| ()));
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pending.timer_armed(max_attempts) => {
                    if write_pending(&adapter, &key, &mut pending, &events_tx).await.is_ok() {
                        pending.failures = 0;
                        deadline = Instant::now() + debounce;
                    } else {
                        pending.failures += 1;
                        if pending.failures >= max_attempts {
                            warn!(attempts = pending.failures, "queue save parked until the next request or flush");
                        }
                        deadline = Instant::now() + retry_delay(debounce, pending.failures);
                    }
                }
            }
        }
        debug!("queue saver stopped");
    });
}

/// On failure the payload stays pending unless a newer one replaced it.
async fn write_pending(
    adapter: &Arc<Mutex<Box<dyn PersistenceAdapter>>>,
    key: &Arc<str>,
    pending: &mut Pending,
    events_tx: &broadcast::Sender<SaveEvent>,
) -> Result<bool, PersistError> {
    let Some(payload) = pending.payload.take() else {
        return Ok(false);
    };
    let coalesced = std::mem::take(&mut pending.coalesced);

    let adapter_ref = Arc::clone(adapter);
    let key_ref = Arc::clone(key);
    let (payload, result) = tokio::task::spawn_blocking(move || {
        let mut adapter = adapter_ref.blocking_lock();
        let result = adapter.set(&key_ref, &payload);
        (payload, result)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match result {
        Ok(()) => {
            debug!(key = %key, bytes = payload.len(), coalesced, "queue saved");
            let _ = events_tx.send(SaveEvent::Saved {
                bytes: payload.len(),
                coalesced,
            });
            Ok(true)
        }
        Err(err) => {
            warn!(key = %key, %err, "queue save failed");
            let _ = events_tx.send(SaveEvent::Failed {
                error: err.to_string(),
            });
            if pending.payload.is_none() {
                pending.payload = Some(payload);
                pending.coalesced = coalesced;
            }
            Err(err)
        }
    }
}
