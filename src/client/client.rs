use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::anyhow;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::client_config::ClientConfig;
use crate::error::PeerLinkError;
use crate::messaging::message::{is_reserved_message_type, Message, ReceivedMessage};
use crate::messaging::reliable_connection::{ConnectionHandler, ConnectionState, ReliableConnection};
use crate::transport::{peer_id_for_code, wait_until_open, DataChannel, Peer, PeerNetwork};
use crate::util::event::EventChannel;

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), PeerLinkError>>>;

struct ClientInner {
    /// local identity, registered while connecting or connected
    peer: Option<Arc<dyn Peer>>,
    /// the connect attempt in flight, shared by all callers of `connect()` while connecting
    attempt: Option<ConnectAttempt>,
    code: Option<String>,
}

/// Connects to a server identified by a connection code, and exchanges messages with it over a
///  [ReliableConnection].
///
/// There is no automatic reconnection: after the connection is lost, the client is
///  DISCONNECTED and `connect()` may be called again.
pub struct Client {
    config: Arc<ClientConfig>,
    network: Arc<dyn PeerNetwork>,
    myself: Weak<Client>,
    connection: Arc<ReliableConnection>,
    inner: Mutex<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, network: Arc<dyn PeerNetwork>) -> anyhow::Result<Arc<Client>> {
        config.validate()?;

        let connection_config = Arc::new(config.connection.clone());
        Ok(Arc::new_cyclic(|myself: &Weak<Client>| {
            let handler: Weak<dyn ConnectionHandler> = myself.clone();
            Client {
                config: Arc::new(config),
                network,
                myself: myself.clone(),
                connection: ReliableConnection::new(connection_config, ConnectionState::Disconnected, handler),
                inner: Mutex::new(ClientInner {
                    peer: None,
                    attempt: None,
                    code: None,
                }),
            }
        }))
    }

    fn inner(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap()
    }

    /// Opens a local identity and a data channel to the server listening for `code`.
    ///
    /// Calling this while a connect attempt is in flight does not start another attempt: the
    ///  caller gets the outcome of the attempt in flight.
    pub async fn connect(&self, code: &str) -> Result<(), PeerLinkError> {
        let (sender, receiver) = oneshot::channel::<Result<(), PeerLinkError>>();
        let new_attempt: ConnectAttempt = receiver
            .map(|result| result.unwrap_or_else(|_| Err(anyhow!("connect attempt was abandoned").into())))
            .boxed()
            .shared();

        let attempt = {
            let mut inner = self.inner();
            if let Some(attempt) = &inner.attempt {
                warn!("connect({:?}) called while already connecting - waiting for the attempt in flight", code);
                Some(attempt.clone())
            }
            else if self.connection.state() == ConnectionState::Connected {
                return Err(PeerLinkError::AlreadyConnected);
            }
            else {
                inner.attempt = Some(new_attempt.clone());
                inner.code = Some(code.to_string());
                None
            }
        };
        if let Some(attempt) = attempt {
            return attempt.await;
        }

        let Some(client) = self.myself.upgrade() else {
            self.inner().attempt = None;
            return Err(anyhow!("client was dropped").into());
        };

        self.connection.transition(ConnectionState::Connecting);
        let code = code.to_string();
        tokio::spawn(async move {
            let result = match client.run_connect(&code).await {
                Ok(()) if client.connection.compare_and_set_state(ConnectionState::Connecting, ConnectionState::Connected) => Ok(()),
                // the channel closed after it was bound, and the close hook already cleaned up
                Ok(()) => Err(PeerLinkError::ChannelClosed),
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => info!("connected to server with code {:?}", code),
                Err(e) => {
                    info!("connecting to server with code {:?} failed: {}", code, e);
                    client.connection.transition(ConnectionState::Disconnected);
                }
            }
            client.inner().attempt = None;
            let _ = sender.send(result);
        });

        new_attempt.await
    }

    async fn run_connect(&self, code: &str) -> Result<(), PeerLinkError> {
        let remote_id = peer_id_for_code(&self.config.id_prefix, code);
        debug!("connecting to {:?}", remote_id);

        let connect_timeout = self.config.connect_timeout;
        let channel = match tokio::time::timeout(connect_timeout, self.open_channel(&remote_id)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.release_peer();
                return Err(e);
            }
            Err(_) => {
                self.release_peer();
                return Err(PeerLinkError::ConnectTimeout(connect_timeout));
            }
        };

        self.connection.register_connection(Some(channel.clone()));
        if !channel.is_open() {
            // closed between opening and binding, so the close event was missed
            self.connection.register_connection(None);
            self.release_peer();
            return Err(PeerLinkError::ChannelClosed);
        }
        Ok(())
    }

    async fn open_channel(&self, remote_id: &str) -> Result<Arc<dyn DataChannel>, PeerLinkError> {
        let peer = self.network.open_peer(None).await?;
        debug!("opened local identity {:?}", peer.id());
        self.inner().peer = Some(peer.clone());

        let channel = peer.connect(remote_id)?;
        wait_until_open(&channel, self.config.connect_timeout).await?;
        Ok(channel)
    }

    fn release_peer(&self) {
        let peer = self.inner().peer.take();
        if let Some(peer) = peer {
            debug!("releasing local identity {:?}", peer.id());
            peer.destroy();
        }
    }

    fn handle_disconnect(&self) {
        self.connection.register_connection(None);
        self.release_peer();
        self.connection.transition(ConnectionState::Disconnected);
    }

    /// Sends an application message to the server. The reserved types `PING` and `DISCONNECT`
    ///  are sent as-is, with their protocol meaning.
    pub fn send_message(&self, message_type: &str, payload: Value) -> Result<Message, PeerLinkError> {
        if is_reserved_message_type(message_type) {
            warn!("sending message of reserved type {:?}", message_type);
        }
        self.connection.send_message(message_type, payload)
    }

    /// Closes the connection to the server and releases the local identity
    pub fn disconnect(&self) {
        if self.connection.is_connecting() {
            debug!("disconnect while connecting has no effect");
            return;
        }
        self.connection.disconnect();
        self.handle_disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.connection.pending_count()
    }

    pub fn total_message_count(&self) -> u64 {
        self.connection.total_message_count()
    }

    /// code passed to the most recent `connect()` that started an attempt
    pub fn connection_code(&self) -> Option<String> {
        self.inner().code.clone()
    }

    /// id of the local identity, if there is one
    pub fn peer_id(&self) -> Option<String> {
        self.inner().peer.as_ref()
            .map(|peer| peer.id().to_string())
    }

    pub fn connection(&self) -> &Arc<ReliableConnection> {
        &self.connection
    }

    pub fn on_message(&self) -> &EventChannel<ReceivedMessage> {
        self.connection.on_message()
    }

    pub fn on_state_change(&self) -> &EventChannel<ConnectionState> {
        self.connection.on_state_change()
    }

    pub fn on_message_resolved(&self) -> &EventChannel<Message> {
        self.connection.on_message_resolved()
    }
}

impl ConnectionHandler for Client {
    fn on_close(&self) {
        info!("connection to server was closed");
        self.handle_disconnect();
    }

    fn on_error(&self, error: &str) {
        warn!("connection to server failed: {}", error);
        self.handle_disconnect();
    }
}
