//! # ETL Orchestrator Library
//!
//! Job orchestration core for ETL workloads: durable job definitions and
//! instances, a lease-based claim protocol built on conditional updates, a
//! heartbeat/timeout reaper, and a staged pipeline that feeds ingested
//! entities to integration-specific processors.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod ingestion;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod reaper;
pub mod repositories;
pub mod scheduler;
pub mod telemetry;
pub mod worker;
pub mod worker_pool;
pub use migration;
