pub mod hosted_connection;
pub mod server;
pub mod server_config;
