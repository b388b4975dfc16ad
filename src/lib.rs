pub mod cache;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod sync;
pub mod template;
pub mod tx;
