pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod sender;
pub mod step;
pub mod steps;
pub mod store;
pub mod supervisor;
pub mod time;
