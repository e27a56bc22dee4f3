pub mod connection_config;
pub mod envelope;
pub mod message;
pub mod pending_tracker;
pub mod reliable_connection;
