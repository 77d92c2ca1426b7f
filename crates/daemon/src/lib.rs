//! Content factory daemon: admission, production, deferred publication,
//! and the engagement feedback loop.

pub mod activity;
pub mod config;
pub mod context;
pub mod daily;
pub mod feedback;
pub mod gate;
pub mod http;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod publish;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod stages;
pub mod storage;
pub mod store;
pub mod trends;
