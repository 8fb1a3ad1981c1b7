pub mod api;
pub mod config;
pub mod logger;
pub mod signal;
pub mod worker;
