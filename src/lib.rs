//! # mastery-engine
//!
//! Stateful mastery & analytics engine for learning platforms.
//!
//! Ingests per-student learning events exactly-effectively-once, keeps a
//! durable weighted mastery score per (student, component), projects short
//! horizon trends, turns gaps into ranked recommendations, and runs batch
//! and cohort analytics. Every state-store and event-bus call is guarded by
//! a per-dependency circuit breaker with bounded retry.

pub mod analytics;
pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod mastery;
pub mod model;
pub mod predict;
pub mod recommend;
pub mod resilience;
pub mod service;
pub mod store;
pub mod telemetry;
