//! Primary task store for tentackl.
//!
//! PostgreSQL row models, status enums, and query modules for tasks, steps,
//! findings, checkpoints, learned preferences, triggers, automations,
//! external event sources, and inbox messages.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
