use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::error::PeerLinkError;
use crate::messaging::connection_config::ConnectionConfig;
use crate::messaging::message::{is_reserved_message_type, Message, ReceivedMessage};
use crate::messaging::reliable_connection::{ConnectionHandler, ConnectionState, ReliableConnection};
use crate::transport::{ChannelEvent, DataChannel};
use crate::util::event::{EventChannel, Subscription};

/// Receives the state changes of hosted connections; this is how a server keeps its
///  connecting / connected bookkeeping current without polling.
pub trait HostedConnectionObserver: Send + Sync + 'static {
    fn on_hosted_connection_state(&self, connection: &Arc<HostedConnection>, state: ConnectionState);
}

/// Server-side handle for one client's data channel. It starts out CONNECTING and completes the
///  handshake on its own once the channel is open.
pub struct HostedConnection {
    id: u64,
    channel: Arc<dyn DataChannel>,
    myself: Weak<HostedConnection>,
    observer: Weak<dyn HostedConnectionObserver>,
    connection: Arc<ReliableConnection>,
    handshake_done: AtomicBool,
    handshake_subscription: Mutex<Option<Subscription<ChannelEvent>>>,
}

impl HostedConnection {
    pub fn new(id: u64, channel: Arc<dyn DataChannel>, config: Arc<ConnectionConfig>, observer: Weak<dyn HostedConnectionObserver>) -> Arc<HostedConnection> {
        Arc::new_cyclic(|myself: &Weak<HostedConnection>| {
            let handler: Weak<dyn ConnectionHandler> = myself.clone();
            HostedConnection {
                id,
                channel,
                myself: myself.clone(),
                observer,
                connection: ReliableConnection::new(config, ConnectionState::Connecting, handler),
                handshake_done: AtomicBool::new(false),
                handshake_subscription: Default::default(),
            }
        })
    }

    /// Transitions to CONNECTED right away if the channel is open, otherwise when it opens.
    ///  Closing or failing before that ends the handshake in DISCONNECTED.
    pub fn begin_handshake(&self) {
        if self.channel.is_open() {
            trace!("data channel from {} is open right away", self.channel.peer_id());
            self.complete_handshake();
            return;
        }

        let myself = self.myself.clone();
        let subscription = self.channel.on(Arc::new(move |evt: &ChannelEvent| {
            let Some(hosted) = myself.upgrade() else {
                return;
            };
            match evt {
                ChannelEvent::Open => hosted.complete_handshake(),
                ChannelEvent::Error(e) => {
                    error!("error during connection initiation with {}: {}", hosted.peer_id(), e);
                    hosted.fail_handshake();
                }
                ChannelEvent::Close => {
                    debug!("data channel from {} closed during connection initiation", hosted.peer_id());
                    hosted.fail_handshake();
                }
                ChannelEvent::Data(_) => {}
            }
        }));
        *self.handshake_subscription.lock().unwrap() = Some(subscription);

        if self.channel.is_open() {
            // opened before the listener was in place
            self.complete_handshake();
        }
    }

    fn end_handshake(&self) -> bool {
        if self.handshake_done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscription = self.handshake_subscription.lock().unwrap().take();
        if let Some(subscription) = subscription {
            subscription.dispose();
        }
        true
    }

    fn complete_handshake(&self) {
        if !self.end_handshake() {
            return;
        }
        self.connection.register_connection(Some(self.channel.clone()));
        if self.connection.compare_and_set_state(ConnectionState::Connecting, ConnectionState::Connected) {
            debug!("connection {} from {} established", self.id, self.peer_id());
            self.notify(ConnectionState::Connected);
        }
    }

    fn fail_handshake(&self) {
        if !self.end_handshake() {
            return;
        }
        if self.connection.compare_and_set_state(ConnectionState::Connecting, ConnectionState::Disconnected) {
            self.notify(ConnectionState::Disconnected);
        }
    }

    fn handle_disconnect(&self) {
        self.connection.register_connection(None);
        if self.connection.transition(ConnectionState::Disconnected) {
            debug!("connection {} from {} ended", self.id, self.peer_id());
            self.notify(ConnectionState::Disconnected);
        }
    }

    fn notify(&self, state: ConnectionState) {
        let (Some(observer), Some(myself)) = (self.observer.upgrade(), self.myself.upgrade()) else {
            return;
        };
        observer.on_hosted_connection_state(&myself, state);
    }

    /// Closes the channel and enters DISCONNECTED right away, without waiting for the close
    ///  event.
    pub fn disconnect(&self) {
        if self.connection.channel().is_some() {
            self.connection.disconnect();
        }
        else {
            self.channel.close();
        }
        self.fail_handshake();
        self.handle_disconnect();
    }

    pub fn send_message(&self, message_type: &str, payload: Value) -> Result<Message, PeerLinkError> {
        if is_reserved_message_type(message_type) {
            warn!("sending message of reserved type {:?}", message_type);
        }
        self.connection.send_message(message_type, payload)
    }

    /// unique per server
    pub fn id(&self) -> u64 {
        self.id
    }

    /// the client's peer id
    pub fn peer_id(&self) -> &str {
        self.channel.peer_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn pending_count(&self) -> usize {
        self.connection.pending_count()
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
}

impl ConnectionHandler for HostedConnection {
    fn on_message(&self, message: &ReceivedMessage) {
        trace!("connection {} received message {} of type {:?}", self.id, message.id, message.message_type);
    }

    fn on_close(&self) {
        self.handle_disconnect();
    }

    fn on_error(&self, error: &str) {
        warn!("connection {} from {} failed: {}", self.id, self.peer_id(), error);
        self.handle_disconnect();
    }
}

impl std::fmt::Debug for HostedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostedConnection{{id:{}, peer:{}, state:{:?}}}", self.id, self.peer_id(), self.state())
    }
}
