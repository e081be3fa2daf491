pub mod app;
pub mod config;
pub mod discovery;
pub mod download;
pub mod humanize;
pub mod model;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod worker;
