pub mod chat;
pub mod compute;
pub mod config;
pub mod controller;
pub mod notify;
pub mod query;
pub mod server;
pub mod sweeper;
pub mod tracing;
