//! Feedback worker — drains unclassified feedback records into sentiment results.

pub mod classifier;
pub mod config;
pub mod error;
pub mod store;
pub mod worker;
