use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::PeerLinkError;
use crate::util::event::{Listener, Subscription};

/// Namespace shared by clients and servers: a server listening for connection code `ABCDE`
///  registers the peer id `DEFAULT_ID_PREFIX + "ABCDE"`.
pub const DEFAULT_ID_PREFIX: &str = "peerlink-";

pub fn peer_id_for_code(prefix: &str, code: &str) -> String {
    format!("{}{}", prefix, code)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    Data(Bytes),
    Open,
    Close,
    Error(String),
}

/// An unreliable duplex data channel to a single remote peer, e.g. a WebRTC data connection.
///
/// Implementations give no delivery or ordering guarantees for sent data; everything built on
///  top of this trait only relies on the capabilities listed here.
pub trait DataChannel: Send + Sync + 'static {
    /// id of the remote peer
    fn peer_id(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, data: Bytes) -> anyhow::Result<()>;

    fn close(&self);

    /// Subscribe to `data`, `open`, `close` and `error` events. The listener is removed by
    ///  disposing the returned subscription.
    fn on(&self, listener: Listener<ChannelEvent>) -> Subscription<ChannelEvent>;
}

/// A registered identity on the signalling network. It can open channels to other identities,
///  and it receives channels opened by others.
pub trait Peer: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Initiates a channel to the peer with the given id. The returned channel is typically
    ///  not open yet, see [wait_until_open].
    fn connect(&self, remote_id: &str) -> anyhow::Result<Arc<dyn DataChannel>>;

    fn on_connection(&self, listener: Listener<Arc<dyn DataChannel>>) -> Subscription<Arc<dyn DataChannel>>;

    /// Releases the identity and closes all of its channels
    fn destroy(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Registers a new identity. `None` lets the network assign an id. Fails if the requested id
    ///  is taken or the network can not be reached.
    async fn open_peer(&self, id: Option<String>) -> anyhow::Result<Arc<dyn Peer>>;
}


/// Waits for a freshly initiated channel to open, failing if it closes or reports an error first,
///  or if it does not open within `timeout`.
pub async fn wait_until_open(channel: &Arc<dyn DataChannel>, timeout: Duration) -> Result<(), PeerLinkError> {
    let (sender, receiver) = oneshot::channel::<anyhow::Result<()>>();
    let sender = Mutex::new(Some(sender));

    let subscription = channel.on(Arc::new(move |evt: &ChannelEvent| {
        let result = match evt {
            ChannelEvent::Open => Ok(()),
            ChannelEvent::Close => Err(anyhow!("data channel closed before it was opened")),
            ChannelEvent::Error(e) => Err(anyhow!("data channel error: {}", e)),
            ChannelEvent::Data(_) => return,
        };
        if let Some(sender) = sender.lock().unwrap().take() {
            let _ = sender.send(result);
        }
    }));

    let result = if channel.is_open() {
        trace!("data channel to {} is already open", channel.peer_id());
        Ok(())
    }
    else {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(anyhow!("data channel listener was dropped").into()),
            Err(_) => Err(PeerLinkError::ConnectTimeout(timeout)),
        }
    };

    subscription.dispose();
    if let Err(e) = &result {
        debug!("data channel to {} did not open: {}", channel.peer_id(), e);
    }
    result
}
