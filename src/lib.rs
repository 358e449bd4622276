//! # farseer-rs
//!
//! Event-driven orchestration for video stream analysis.
//!
//! A stream is started and stopped by commands on a Postgres-backed (pgmq)
//! message bus. The runner owns one capture worker process per stream,
//! inference turns sampled frames into detected labels, the stenographer
//! appends every lifecycle event to a durable log, and the projector relays
//! that log into a read model for queries.

pub mod bus;
pub mod capture;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod model;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod telemetry;

pub use error::{Error, Result};
