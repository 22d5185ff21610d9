//! # stagequeue
//!
//! Durable multi-stage work queue.
//!
//! Producers hand opaque payloads to an in-process [`intake::IntakeBuffer`].
//! Workers flush it into a [`store::QueueStore`] (Postgres via [`db::Db`], or
//! [`store::MemoryStore`]), claim unowned messages in batches, and drive each
//! one through `Uploaded → Ready → Done` with the stage handlers in
//! [`handler`]. Ownership lives in the store, so workers in separate
//! processes coordinate without any shared lock.

pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod intake;
pub mod model;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;
