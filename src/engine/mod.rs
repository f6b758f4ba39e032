//! Engine process: event consumption and dead-letter redrive.

pub mod consumer;

pub use consumer::{Consumer, ConsumerConfig, PollSummary, RedriveSummary};
