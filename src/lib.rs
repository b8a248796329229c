//! Durable, priority-tiered workflow orchestration for shop operations.
//!
//! Runs are journaled step by step so they survive restarts, steps are
//! dispatched through three concurrency-limited pools, and every run fires
//! its completion handler exactly once.

pub mod cli;
pub mod domain;
pub mod engine;
pub mod storage;
