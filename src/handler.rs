//! Stage handlers: one per non-terminal stage.
//!
//! A handler gets a message id its worker owns, does the stage's work, and
//! asks the store to advance the message to the next stage (which also
//! releases it). Dispatch is a plain match over the closed `Stage` set.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Message, MessageId, Stage, WorkerId};
use crate::retry::RetryPolicy;
use crate::store::QueueStore;

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The message moved forward and is no longer owned.
    Advanced { from: Stage, to: Stage },
    /// Someone else already moved or took the message. Nothing changed.
    Stale { from: Stage, to: Stage },
    /// The message is `Done`; there is nothing to do.
    Terminal,
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// Where Ready-stage messages go. Implementations must tolerate seeing the
/// same message more than once: a crash between delivery and advance means
/// it will be delivered again.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    async fn deliver(&self, message: &Message) -> std::result::Result<(), DeliveryError>;
}

/// Delivery that just logs the message. The logged payload is decoded
/// lossily as UTF-8; the stored bytes are untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, message: &Message) -> std::result::Result<(), DeliveryError> {
        info!(
            id = %message.id,
            bytes = message.payload.len(),
            payload = %String::from_utf8_lossy(&message.payload),
            "delivered"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Conditional advance, with a lost race reported as `Transition::Stale`.
///
/// Retried on `StoreUnavailable`. If an earlier attempt did commit, the
/// retry finds the message already moved and reports `Stale`.
async fn advance<S: QueueStore>(
    store: &S,
    retry: &RetryPolicy,
    id: MessageId,
    worker: &WorkerId,
    from: Stage,
    to: Stage,
) -> Result<Transition> {
    match retry
        .run("advance", || store.advance(id, worker, from, to))
        .await
    {
        Ok(()) => Ok(Transition::Advanced { from, to }),
        Err(Error::StaleTransition { .. }) => {
            debug!(%id, %from, %to, "stale transition, message already moved");
            Ok(Transition::Stale { from, to })
        }
        Err(e) => Err(e),
    }
}

/// Uploaded → Ready. Checks the payload, never changes it.
pub struct UploadedHandler<S> {
    store: Arc<S>,
    retry: RetryPolicy,
    max_payload_bytes: Option<usize>,
}

impl<S: QueueStore> UploadedHandler<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy, max_payload_bytes: Option<usize>) -> Self {
        Self {
            store,
            retry,
            max_payload_bytes,
        }
    }

    pub async fn process(&self, id: MessageId, worker: &WorkerId) -> Result<Transition> {
        let store = &*self.store;
        let message = self.retry.run("get_message", || store.get_message(id)).await?;
        if let Some(max) = self.max_payload_bytes
            && message.payload.len() > max
        {
            return Err(Error::HandlerFailure {
                id,
                stage: Stage::Uploaded,
                reason: format!("payload is {} bytes, limit is {max}", message.payload.len()),
            });
        }
        advance(store, &self.retry, id, worker, Stage::Uploaded, Stage::Ready).await
    }
}

/// Ready → Done. Hands the message to the delivery collaborator first.
pub struct ReadyHandler<S, D> {
    store: Arc<S>,
    retry: RetryPolicy,
    delivery: Arc<D>,
}

impl<S: QueueStore, D: Delivery> ReadyHandler<S, D> {
    pub fn new(store: Arc<S>, retry: RetryPolicy, delivery: Arc<D>) -> Self {
        Self {
            store,
            retry,
            delivery,
        }
    }

    /// Delivery happens before the advance. A failed advance after a
    /// successful delivery means the message is delivered again later, so
    /// the advance gets the full store retry budget.
    pub async fn process(&self, id: MessageId, worker: &WorkerId) -> Result<Transition> {
        let store = &*self.store;
        let message = self.retry.run("get_message", || store.get_message(id)).await?;
        self.delivery
            .deliver(&message)
            .await
            .map_err(|e| Error::HandlerFailure {
                id,
                stage: Stage::Ready,
                reason: e.to_string(),
            })?;
        advance(store, &self.retry, id, worker, Stage::Ready, Stage::Done).await
    }
}

/// The stage → handler table.
pub struct Handlers<S, D> {
    uploaded: UploadedHandler<S>,
    ready: ReadyHandler<S, D>,
}

impl<S: QueueStore, D: Delivery> Handlers<S, D> {
    /// `retry` covers the store calls the handlers make.
    pub fn new(
        store: Arc<S>,
        delivery: Arc<D>,
        retry: RetryPolicy,
        max_payload_bytes: Option<usize>,
    ) -> Self {
        Self {
            uploaded: UploadedHandler::new(Arc::clone(&store), retry, max_payload_bytes),
            ready: ReadyHandler::new(store, retry, delivery),
        }
    }

    pub async fn dispatch(
        &self,
        stage: Stage,
        id: MessageId,
        worker: &WorkerId,
    ) -> Result<Transition> {
        match stage {
            Stage::Uploaded => self.uploaded.process(id, worker).await,
            Stage::Ready => self.ready.process(id, worker).await,
            Stage::Done => Ok(Transition::Terminal),
        }
    }
}
