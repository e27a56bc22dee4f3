//! Doubles for the transport layer. They are used for testing this crate, but they are also
//!  exported for application testing, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod channel;
pub mod local_network;
