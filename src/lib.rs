pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod models;
pub mod server;
