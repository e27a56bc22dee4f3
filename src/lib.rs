pub mod client;
pub mod error;
pub mod messaging;
pub mod server;
pub mod test_util;
pub mod transport;
pub mod util;
