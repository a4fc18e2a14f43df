//! fishpool: job dispatch, worker pool and cancellation for batch smFISH
//! image analysis.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod error;
pub mod job;
pub mod keepalive;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod source;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
