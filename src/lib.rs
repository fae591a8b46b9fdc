pub mod api;
pub mod broker;
pub mod calendar;
pub mod config;
pub mod context;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod rate_limiter;
pub mod scheduler;
pub mod session;
pub mod storage;
