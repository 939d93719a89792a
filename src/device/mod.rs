pub mod connection;
pub mod constants;
pub mod manager;
pub mod readiness;
pub mod types;
