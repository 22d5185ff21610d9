//! Worker loop: flush the intake buffer, claim, dispatch one owned message,
//! idle, repeat.
//!
//! Workers never talk to each other. Everything they coordinate on goes
//! through the store, so a group of workers in one process behaves the same
//! as workers spread over several processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::handler::{Delivery, Handlers, Transition};
use crate::intake::IntakeBuffer;
use crate::model::{MessageId, Stage, WorkerId};
use crate::store::QueueStore;
use crate::telemetry::message::{record_outcome, record_stage_transition, start_dispatch_span};
use crate::telemetry::metrics;

/// Local failure records older than this are dropped.
const FAILURE_MEMORY: Duration = Duration::from_secs(3600);

/// How one iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing to do: no owned message, or every owned one is backing off.
    Idle,
    /// A message went through its stage handler.
    Dispatched {
        id: MessageId,
        transition: Transition,
    },
    /// The stage handler failed; the message is still at `stage`.
    Failed {
        id: MessageId,
        stage: Stage,
        released: bool,
    },
    /// The store stayed unavailable through a step's retries; the rest of
    /// the iteration was skipped.
    Unavailable,
    /// A non-transient store error. Logged, iteration skipped.
    StoreError,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    attempts: u32,
    retry_at: Instant,
    failed_at: Instant,
}

pub struct Worker<S, D> {
    id: WorkerId,
    store: Arc<S>,
    intake: Arc<IntakeBuffer>,
    handlers: Handlers<S, D>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    /// Messages whose handler failed recently, keyed by id.
    failures: HashMap<MessageId, Failure>,
}

impl<S: QueueStore, D: Delivery> Worker<S, D> {
    pub fn new(
        store: Arc<S>,
        intake: Arc<IntakeBuffer>,
        delivery: Arc<D>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let handlers = Handlers::new(
            Arc::clone(&store),
            delivery,
            config.store_retry,
            config.max_payload_bytes,
        );
        Self {
            id: WorkerId::new(),
            store,
            intake,
            handlers,
            config,
            shutdown,
            failures: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Loop until shutdown is requested. The iteration in flight when that
    /// happens runs to completion. Owned messages are not released on exit.
    ///
    /// Returns `Error::StoreUnreachable` after `max_unavailable_cycles`
    /// consecutive iterations found the store unavailable.
    pub async fn run(mut self) -> Result<()> {
        info!(worker = %self.id, "worker started");
        let max_unavailable = self.config.max_unavailable_cycles.max(1);
        let mut unavailable = 0u32;

        while !self.shutdown.is_cancelled() {
            match self.run_once().await {
                Cycle::Unavailable => {
                    unavailable += 1;
                    if unavailable >= max_unavailable {
                        error!(
                            worker = %self.id,
                            cycles = unavailable,
                            "queue store unreachable, stopping worker"
                        );
                        return Err(Error::StoreUnreachable {
                            cycles: unavailable,
                        });
                    }
                }
                _ => unavailable = 0,
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!(worker = %self.id, "worker stopped");
        Ok(())
    }

    /// One iteration: flush, claim, pick, dispatch.
    pub async fn run_once(&mut self) -> Cycle {
        self.failures
            .retain(|_, f| f.failed_at.elapsed() < FAILURE_MEMORY);

        if !self.flush().await {
            return Cycle::Unavailable;
        }

        let store = Arc::clone(&self.store);
        let worker = self.id.clone();
        let retry = self.config.store_retry;
        let policy = self.config.claim_policy();

        match retry
            .run("claim_batch", || store.claim_batch(&worker, policy))
            .await
        {
            Ok(0) => {}
            Ok(n) => {
                debug!(worker = %worker, claimed = n, "claimed batch");
                metrics::messages_claimed().add(n, &[]);
            }
            Err(e) => return self.store_failure("claim_batch", &e),
        }

        let id = match self.pick(&*store, &worker).await {
            Ok(Some(id)) => id,
            Ok(None) => return Cycle::Idle,
            Err(e) => return self.store_failure("next_owned", &e),
        };

        let stage = match retry.run("get_stage", || store.get_stage(id)).await {
            Ok(stage) => stage,
            Err(e) => return self.store_failure("get_stage", &e),
        };

        let span = start_dispatch_span(&worker, id, stage);
        let started = Instant::now();
        let result = self
            .handlers
            .dispatch(stage, id, &worker)
            .instrument(span.clone())
            .await;
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("stage", stage.to_string())],
        );

        match result {
            Ok(transition) => {
                self.failures.remove(&id);
                match transition {
                    Transition::Advanced { from, to } => {
                        record_stage_transition(&span, from, to);
                        record_outcome(&span, "advanced");
                        record_transition_metric(from, to, "advanced");
                    }
                    Transition::Stale { from, to } => {
                        record_outcome(&span, "stale");
                        record_transition_metric(from, to, "stale");
                    }
                    Transition::Terminal => record_outcome(&span, "terminal"),
                }
                Cycle::Dispatched { id, transition }
            }
            Err(e) if e.is_transient() => {
                record_outcome(&span, "unavailable");
                self.store_failure("dispatch", &e)
            }
            Err(e) => {
                record_outcome(&span, "failed");
                self.handler_failed(id, stage, e).instrument(span).await
            }
        }
    }

    /// Drain the intake buffer into the store. Returns false if the store
    /// was unavailable; undelivered payloads are back in the buffer then.
    async fn flush(&self) -> bool {
        let mut pending = self.intake.drain_all().into_iter();
        let store = &*self.store;

        while let Some(p) = pending.next() {
            let inserted = self
                .config
                .store_retry
                .run("insert", || store.insert(&p.payload))
                .await;
            match inserted {
                Ok(id) => {
                    debug!(worker = %self.id, %id, "persisted intake payload");
                    metrics::messages_inserted().add(1, &[KeyValue::new("result", "ok")]);
                }
                Err(e) if e.is_transient() => {
                    self.store_failure("insert", &e);
                    self.intake.restore(p);
                    pending.by_ref().for_each(|rest| self.intake.restore(rest));
                    return false;
                }
                Err(e) => {
                    self.store_failure("insert", &e);
                    metrics::messages_inserted().add(1, &[KeyValue::new("result", "requeued")]);
                    self.intake.requeue(p);
                }
            }
        }
        true
    }

    /// Next owned message that is not backing off from a handler failure.
    async fn pick(&self, store: &S, worker: &WorkerId) -> Result<Option<MessageId>> {
        let retry = self.config.store_retry;
        let Some(first) = retry
            .run("next_owned", || store.next_owned(worker))
            .await?
        else {
            return Ok(None);
        };
        if !self.is_backing_off(first) {
            return Ok(Some(first));
        }

        let owned = retry.run("owned_ids", || store.owned_ids(worker)).await?;
        Ok(owned.into_iter().find(|id| !self.is_backing_off(*id)))
    }

    fn is_backing_off(&self, id: MessageId) -> bool {
        self.failures
            .get(&id)
            .is_some_and(|f| f.retry_at > Instant::now())
    }

    /// Keep the message for a later local retry, or release it once the
    /// local attempt budget is spent so any worker can pick it up.
    async fn handler_failed(&mut self, id: MessageId, stage: Stage, err: Error) -> Cycle {
        let now = Instant::now();
        let budget = self.config.handler_retry.max_attempts.max(1);

        let entry = self.failures.entry(id).or_insert(Failure {
            attempts: 0,
            retry_at: now,
            failed_at: now,
        });
        entry.attempts += 1;
        entry.failed_at = now;
        entry.retry_at = now + self.config.handler_retry.backoff(entry.attempts - 1);
        let attempts = entry.attempts;
        let release = attempts % budget == 0;

        let action = if release { "release" } else { "retry" };
        metrics::handler_failures().add(
            1,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("action", action),
            ],
        );

        if !release {
            warn!(worker = %self.id, %id, %stage, attempts, "stage handler failed, will retry: {err}");
            return Cycle::Failed {
                id,
                stage,
                released: false,
            };
        }

        warn!(worker = %self.id, %id, %stage, attempts, "stage handler failed, releasing message: {err}");
        let store = Arc::clone(&self.store);
        let worker = self.id.clone();
        match self
            .config
            .store_retry
            .run("release", || store.release(id, &worker))
            .await
        {
            Ok(()) | Err(Error::StaleTransition { .. }) => Cycle::Failed {
                id,
                stage,
                released: true,
            },
            Err(e) => self.store_failure("release", &e),
        }
    }

    fn store_failure(&self, operation: &'static str, err: &Error) -> Cycle {
        if err.is_transient() {
            warn!(worker = %self.id, operation, "queue store unavailable: {err}");
            metrics::store_errors().add(
                1,
                &[
                    KeyValue::new("operation", operation),
                    KeyValue::new("kind", "unavailable"),
                ],
            );
            Cycle::Unavailable
        } else {
            error!(worker = %self.id, operation, "queue store error: {err}");
            metrics::store_errors().add(
                1,
                &[
                    KeyValue::new("operation", operation),
                    KeyValue::new("kind", "other"),
                ],
            );
            Cycle::StoreError
        }
    }
}

fn record_transition_metric(from: Stage, to: Stage, result: &'static str) {
    metrics::stage_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

// ---------------------------------------------------------------------------
// Worker group
// ---------------------------------------------------------------------------

/// A set of workers sharing one store, one intake buffer and one shutdown
/// token.
pub struct WorkerGroup {
    shutdown: CancellationToken,
    ids: Vec<WorkerId>,
    tasks: JoinSet<(WorkerId, Result<()>)>,
}

impl WorkerGroup {
    /// Spawn `n` workers, each with a fresh `WorkerId`.
    pub fn spawn<S: QueueStore, D: Delivery>(
        n: usize,
        store: Arc<S>,
        intake: Arc<IntakeBuffer>,
        delivery: Arc<D>,
        config: WorkerConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut ids = Vec::with_capacity(n);
        let mut tasks = JoinSet::new();
        for _ in 0..n {
            let worker = Worker::new(
                Arc::clone(&store),
                Arc::clone(&intake),
                Arc::clone(&delivery),
                config.clone(),
                shutdown.child_token(),
            );
            let id = worker.id().clone();
            ids.push(id.clone());
            tasks.spawn(async move { (id, worker.run().await) });
        }

        Self {
            shutdown,
            ids,
            tasks,
        }
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.ids.clone()
    }

    /// Token that stops every worker in the group when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask every worker to stop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to exit, in the order they finish. The first
    /// worker to fail stops the rest of the group; its error is returned.
    pub async fn join(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failed = match joined {
                Ok((_, Ok(()))) => None,
                Ok((id, Err(e))) => {
                    error!(worker = %id, "worker exited with error: {e}");
                    Some(e)
                }
                Err(e) => {
                    error!("worker task failed: {e}");
                    Some(Error::Other(format!("worker task failed: {e}")))
                }
            };
            if let Some(e) = failed
                && first_err.is_none()
            {
                self.shutdown.cancel();
                first_err = Some(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn shutdown_and_join(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
