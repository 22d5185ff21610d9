//! Intake buffer: the in-process handoff between producers and the store.
//!
//! `submit` never blocks and may be called from any task. `drain_all` is
//! meant for one drainer at a time; a second concurrent drainer gets an
//! empty batch instead of waiting. Nothing here is durable.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, warn};

use crate::telemetry::metrics;

/// A submitted payload waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub payload: Vec<u8>,
    /// Failed insert attempts so far.
    pub attempts: u32,
}

impl Pending {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            attempts: 0,
        }
    }
}

pub struct IntakeBuffer {
    tx: UnboundedSender<Pending>,
    rx: Mutex<UnboundedReceiver<Pending>>,
    dead_letters: Mutex<Vec<Pending>>,
    /// Inserts allowed per payload before it is dead-lettered.
    max_insert_attempts: u32,
}

impl IntakeBuffer {
    pub fn new(max_insert_attempts: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            dead_letters: Mutex::new(Vec::new()),
            max_insert_attempts: max_insert_attempts.max(1),
        }
    }

    /// Hand a payload to the queue. Durable only after the next flush.
    pub fn submit(&self, payload: impl Into<Vec<u8>>) {
        self.push(Pending::new(payload.into()));
        metrics::messages_submitted().add(1, &[]);
    }

    /// Take everything currently buffered.
    pub fn drain_all(&self) -> Vec<Pending> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Ok(pending) = rx.try_recv() {
            drained.push(pending);
        }
        drained
    }

    /// Put back a payload whose insert failed. Once it has used up its
    /// attempts it goes to the dead-letter list instead.
    pub fn requeue(&self, mut pending: Pending) {
        pending.attempts += 1;
        if pending.attempts >= self.max_insert_attempts {
            error!(
                attempts = pending.attempts,
                bytes = pending.payload.len(),
                "payload could not be persisted, dead-lettering"
            );
            metrics::dead_letters().add(1, &[]);
            match self.dead_letters.lock() {
                Ok(mut dl) => dl.push(pending),
                Err(poisoned) => poisoned.into_inner().push(pending),
            }
            return;
        }
        self.push(pending);
    }

    /// Put back a drained payload that was never attempted.
    pub fn restore(&self, pending: Pending) {
        self.push(pending);
    }

    /// Remove and return every dead-lettered payload.
    pub fn take_dead_letters(&self) -> Vec<Pending> {
        match self.dead_letters.lock() {
            Ok(mut dl) => std::mem::take(&mut *dl),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn push(&self, pending: Pending) {
        // The receiver lives as long as self, so this only fails if it was
        // closed explicitly.
        if self.tx.send(pending).is_err() {
            warn!("intake buffer closed, payload not accepted");
        }
    }
}

impl Default for IntakeBuffer {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drain_returns_everything_once() {
        let intake = IntakeBuffer::default();
        intake.submit(b"a".to_vec());
        intake.submit("b");

        let drained: Vec<_> = intake.drain_all().into_iter().map(|p| p.payload).collect();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(intake.drain_all().is_empty());
    }

    #[test]
    fn concurrent_submitters_lose_nothing() {
        let intake = Arc::new(IntakeBuffer::default());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let intake = Arc::clone(&intake);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        intake.submit(format!("{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(intake.drain_all().len(), 400);
    }

    #[test]
    fn requeue_dead_letters_after_max_attempts() {
        let intake = IntakeBuffer::new(2);
        intake.submit("poison");

        let first = intake.drain_all().pop().unwrap();
        intake.requeue(first);
        let second = intake.drain_all().pop().unwrap();
        assert_eq!(second.attempts, 1);

        intake.requeue(second);
        assert!(intake.drain_all().is_empty());

        let dead = intake.take_dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"poison".to_vec());
        assert!(intake.take_dead_letters().is_empty());
    }
}
