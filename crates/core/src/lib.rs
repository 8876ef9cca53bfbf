// Core types and functionality for the pipeliner task runner

pub mod types;
pub mod error;
pub mod events;
pub mod ports;
pub mod runner;
pub mod template;
pub mod workflow;
pub mod storage;
pub mod timezone;
pub mod schedule_file;
pub mod paths;
pub mod daemon;
pub mod scheduler;

pub use types::*;
