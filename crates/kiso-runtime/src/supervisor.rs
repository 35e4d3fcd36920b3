//! Supervisor — process-wide registry of per-session workers.
//!
//! The registry is a plain `Mutex<HashMap>`: every critical section is a few
//! map operations with no suspension point inside, which is what makes
//! "check-then-spawn" atomic. Workers remove themselves under the same lock
//! when they idle out, so a worker observed in the map is always accepting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiso_core::types::PlanStatus;

use crate::worker::{self, WorkerDeps};

/// One live worker's handle as seen by the supervisor.
pub struct WorkerHandle {
    pub queue: mpsc::Sender<i64>,
    /// Current message's cancel token; the worker installs a fresh one per
    /// message, the supervisor trips it on /cancel.
    pub cancel: Arc<Mutex<CancellationToken>>,
    pub join: JoinHandle<()>,
}

pub type WorkerRegistry = Arc<Mutex<HashMap<String, WorkerHandle>>>;

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Untrusted input is persisted but never enqueued.
    Untrusted,
    /// Bounded queue is full; the message stays unprocessed for later.
    QueueFull,
}

#[derive(Debug, serde::Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<i64>,
}

pub struct Supervisor {
    deps: Arc<WorkerDeps>,
    workers: WorkerRegistry,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(deps: Arc<WorkerDeps>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            deps,
            workers: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    /// Persist an inbound message and, when trusted, hand it to the
    /// session's worker (spawning one if needed).
    ///
    /// `user` is the already-resolved whitelisted username; `None` marks the
    /// message untrusted.
    pub async fn on_message(
        &self,
        session: &str,
        user: Option<&str>,
        content: &str,
    ) -> Result<EnqueueOutcome, kiso_store::StoreError> {
        let trusted = user.is_some();
        self.deps
            .store
            .create_or_update_session(session, None, None, None)?;
        let message_id = self
            .deps
            .store
            .save_message(session, user, "user", content, trusted)?;

        if !trusted {
            info!(session, message_id, "untrusted message stored; not enqueued");
            return Ok(EnqueueOutcome::Untrusted);
        }

        Ok(self.enqueue(session, message_id))
    }

    /// Atomic ensure-worker + enqueue. The registry lock covers the map
    /// check, the spawn, and the `try_send`, so a worker cannot disappear
    /// between being found and being handed the message.
    fn enqueue(&self, session: &str, message_id: i64) -> EnqueueOutcome {
        let mut workers = self.workers.lock().unwrap();

        if let Some(handle) = workers.get(session) {
            return match handle.queue.try_send(message_id) {
                Ok(()) => EnqueueOutcome::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session, "session queue full; message left unprocessed");
                    EnqueueOutcome::QueueFull
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The worker exited without deregistering (crash); replace it.
                    warn!(session, "stale worker handle; respawning");
                    workers.remove(session);
                    self.spawn_locked(&mut workers, session, message_id)
                }
            };
        }

        self.spawn_locked(&mut workers, session, message_id)
    }

    fn spawn_locked(
        &self,
        workers: &mut HashMap<String, WorkerHandle>,
        session: &str,
        message_id: i64,
    ) -> EnqueueOutcome {
        let capacity = self.deps.config.load().settings.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = Arc::new(Mutex::new(CancellationToken::new()));

        let join = tokio::spawn(worker::run_worker(
            Arc::clone(&self.deps),
            Arc::clone(&self.workers),
            session.to_string(),
            rx,
            Arc::clone(&cancel),
            self.shutdown_tx.subscribe(),
        ));

        // Enqueue before inserting so the fresh channel cannot be full.
        let outcome = match tx.try_send(message_id) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(_) => EnqueueOutcome::QueueFull,
        };
        workers.insert(
            session.to_string(),
            WorkerHandle {
                queue: tx,
                cancel,
                join,
            },
        );
        info!(session, "worker spawned");
        outcome
    }

    /// Trip the cancel flag of the session's in-flight message.
    pub fn on_cancel(&self, session: &str) -> CancelOutcome {
        let workers = self.workers.lock().unwrap();
        match workers.get(session) {
            Some(handle) => {
                handle.cancel.lock().unwrap().cancel();
                drop(workers);
                let plan_id = self
                    .deps
                    .store
                    .last_plan_for_session(session)
                    .ok()
                    .flatten()
                    .filter(|p| p.status == PlanStatus::Running)
                    .map(|p| p.id);
                CancelOutcome {
                    cancelled: true,
                    plan_id,
                }
            }
            None => CancelOutcome {
                cancelled: false,
                plan_id: None,
            },
        }
    }

    /// Crash recovery: fail leftover running work and re-enqueue the
    /// trusted messages that never finished processing.
    pub fn on_startup(&self) -> Result<usize, kiso_store::StoreError> {
        let pending = self.deps.store.recover_running_on_startup()?;
        let count = pending.len();
        for (session, message_id) in pending {
            match self.enqueue(&session, message_id) {
                EnqueueOutcome::Queued => {}
                outcome => warn!(session, message_id, ?outcome, "startup re-enqueue incomplete"),
            }
        }
        if count > 0 {
            info!(count, "messages re-enqueued after restart");
        }
        Ok(count)
    }

    /// Queue depth and liveness for `/status`.
    pub fn session_stats(&self, session: &str) -> (usize, bool) {
        let workers = self.workers.lock().unwrap();
        match workers.get(session) {
            Some(handle) => {
                let queued = handle.queue.max_capacity() - handle.queue.capacity();
                (queued, true)
            }
            None => (0, false),
        }
    }

    /// Graceful stop: signal all workers, give them a grace period to finish
    /// the current task, then abort the stragglers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let grace = Duration::from_secs(self.deps.config.load().settings.shutdown_grace_secs);

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain().map(|(s, h)| (s, h.join)).collect()
        };

        for (session, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => info!(session, "worker stopped"),
                Err(_) => {
                    warn!(session, "worker did not stop within grace period; aborting");
                    abort.abort();
                }
            }
        }
        info!("supervisor shutdown complete");
    }
}
