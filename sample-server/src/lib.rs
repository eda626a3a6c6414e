pub mod config;
pub mod error;
pub mod server;
pub mod service;
pub mod session;
