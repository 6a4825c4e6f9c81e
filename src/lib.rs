pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod master;
pub mod reconciler;
pub mod recovery;
pub mod shutdown;
pub mod store;
