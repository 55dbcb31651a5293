//! # skillq
//!
//! Coordination layer for extracting technical skills from service tickets.
//!
//! Pulls closed tickets from a source feed into a durable Postgres queue
//! (checkpointed), lets any number of workers claim batches atomically,
//! runs each ticket through a locally hosted model, and parses the
//! untrusted model output into a validated skill list.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod llm;
pub mod model;
pub mod parser;
pub mod population;
pub mod source;
pub mod store;
pub mod telemetry;
