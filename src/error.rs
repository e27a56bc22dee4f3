use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors reported to callers of the client, server and connection APIs.
///
/// This is `Clone` so that a single connect attempt's outcome can be handed to every caller
///  awaiting it; collaborator errors are shared through an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum PeerLinkError {
    #[error("send message error: data channel is closed")]
    ChannelClosed,
    #[error("send message error: pending message tracker is missing")]
    TrackerMissing,
    #[error("server start error: server is already in starting state")]
    AlreadyStarting,
    #[error("connect error: client is already connected")]
    AlreadyConnected,
    #[error("timeout after {0:?} waiting for the data channel to open - is the remote peer open?")]
    ConnectTimeout(Duration),
    #[error("server start error: no listening identity after {attempts} attempts: {last_error}")]
    StartFailed {
        attempts: usize,
        last_error: Arc<anyhow::Error>,
    },
    #[error("transport error: {0}")]
    Transport(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for PeerLinkError {
    fn from(value: anyhow::Error) -> Self {
        PeerLinkError::Transport(Arc::new(value))
    }
}
