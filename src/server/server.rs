use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::error::PeerLinkError;
use crate::messaging::connection_config::ConnectionConfig;
use crate::messaging::reliable_connection::ConnectionState;
use crate::server::hosted_connection::{HostedConnection, HostedConnectionObserver};
use crate::server::server_config::ServerConfig;
use crate::transport::{peer_id_for_code, DataChannel, Peer, PeerNetwork};
use crate::util::event::{EventChannel, Subscription};
use crate::util::random::{CodeGenerator, RandomCodeGenerator};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

struct ServerInner {
    state: ServerState,
    /// incremented by every start and stop, so that stale start attempts and channels accepted
    ///  by a previous listening identity are recognized
    generation: u64,
    peer: Option<Arc<dyn Peer>>,
    peer_subscription: Option<Subscription<Arc<dyn DataChannel>>>,
    connection_code: Option<String>,
    connecting: Vec<Arc<HostedConnection>>,
    connected: Vec<Arc<HostedConnection>>,
    next_connection_id: u64,
}

impl ServerInner {
    /// Resets the listening state, returning everything that needs to be released
    fn take_resources(&mut self) -> (Option<Subscription<Arc<dyn DataChannel>>>, Option<Arc<dyn Peer>>, Vec<Arc<HostedConnection>>) {
        self.generation += 1;
        self.connection_code = None;
        let mut clients = std::mem::take(&mut self.connecting);
        clients.append(&mut self.connected);
        (self.peer_subscription.take(), self.peer.take(), clients)
    }
}

fn release(subscription: Option<Subscription<Arc<dyn DataChannel>>>, peer: Option<Arc<dyn Peer>>, clients: Vec<Arc<HostedConnection>>) {
    if let Some(subscription) = subscription {
        subscription.dispose();
    }
    // handles are out of the server's bookkeeping at this point, so disconnecting them does not
    //  produce notifications
    for client in clients {
        client.disconnect();
    }
    if let Some(peer) = peer {
        debug!("releasing listening identity {:?}", peer.id());
        peer.destroy();
    }
}

/// Listens for clients under a connection code and keeps track of the clients that are
///  connecting and connected.
pub struct Server {
    config: Arc<ServerConfig>,
    connection_config: Arc<ConnectionConfig>,
    network: Arc<dyn PeerNetwork>,
    code_generator: Arc<dyn CodeGenerator>,
    myself: Weak<Server>,
    inner: Mutex<ServerInner>,
    on_client_connected: EventChannel<Arc<HostedConnection>>,
    on_client_disconnected: EventChannel<Arc<HostedConnection>>,
    on_state_change: EventChannel<ServerState>,
}

impl Server {
    pub fn new(config: ServerConfig, network: Arc<dyn PeerNetwork>) -> anyhow::Result<Arc<Server>> {
        let code_generator = RandomCodeGenerator::new(&config.code_alphabet, config.code_length)?;
        Server::with_code_generator(config, network, Arc::new(code_generator))
    }

    pub fn with_code_generator(config: ServerConfig, network: Arc<dyn PeerNetwork>, code_generator: Arc<dyn CodeGenerator>) -> anyhow::Result<Arc<Server>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|myself| Server {
            connection_config: Arc::new(config.connection.clone()),
            config: Arc::new(config),
            network,
            code_generator,
            myself: myself.clone(),
            inner: Mutex::new(ServerInner {
                state: ServerState::Stopped,
                generation: 0,
                peer: None,
                peer_subscription: None,
                connection_code: None,
                connecting: Vec::new(),
                connected: Vec::new(),
                next_connection_id: 0,
            }),
            on_client_connected: Default::default(),
            on_client_disconnected: Default::default(),
            on_state_change: Default::default(),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, ServerInner> {
        self.inner.lock().unwrap()
    }

    /// [Server::start_with_retries] with the configured number of retries
    pub async fn start(&self, preferred_code: Option<&str>) -> Result<String, PeerLinkError> {
        self.start_with_retries(preferred_code, self.config.max_start_retries).await
    }

    /// Registers a listening identity and starts accepting clients, returning the connection
    ///  code clients need to connect.
    ///
    /// The first attempt uses the preferred code if there is one, every further attempt a
    ///  freshly generated code. A running server is restarted: its clients are dropped without
    ///  notifications.
    pub async fn start_with_retries(&self, preferred_code: Option<&str>, max_retries: usize) -> Result<String, PeerLinkError> {
        let (subscription, peer, clients, generation) = {
            let mut inner = self.inner();
            if inner.state == ServerState::Starting {
                return Err(PeerLinkError::AlreadyStarting);
            }
            let (subscription, peer, clients) = inner.take_resources();
            inner.state = ServerState::Starting;
            (subscription, peer, clients, inner.generation)
        };
        release(subscription, peer, clients);
        self.on_state_change.emit(&ServerState::Starting);

        let attempts = max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            let code = match (attempt, preferred_code) {
                (0, Some(code)) => code.to_string(),
                _ => self.code_generator.generate(),
            };
            let peer_id = peer_id_for_code(&self.config.id_prefix, &code);

            match self.network.open_peer(Some(peer_id)).await {
                Ok(peer) => return self.on_bound(generation, peer, code),
                Err(e) => {
                    debug!("attempt {} of {} to listen with code {:?} failed: {}", attempt + 1, attempts, code, e);
                    last_error = Some(e);
                }
            }
        }

        let changed = {
            let mut inner = self.inner();
            if inner.generation == generation {
                inner.state = ServerState::Stopped;
                true
            }
            else {
                false
            }
        };
        if changed {
            self.on_state_change.emit(&ServerState::Stopped);
        }

        let last_error = last_error.unwrap_or_else(|| anyhow!("no attempt was made"));
        warn!("server could not start after {} attempts: {}", attempts, last_error);
        Err(PeerLinkError::StartFailed {
            attempts,
            last_error: Arc::new(last_error),
        })
    }

    fn on_bound(&self, generation: u64, peer: Arc<dyn Peer>, code: String) -> Result<String, PeerLinkError> {
        let myself = self.myself.clone();
        let subscription = peer.on_connection(Arc::new(move |channel: &Arc<dyn DataChannel>| {
            if let Some(server) = myself.upgrade() {
                server.accept(generation, channel.clone());
            }
        }));

        {
            let mut inner = self.inner();
            if inner.generation != generation {
                drop(inner);
                debug!("server was stopped while starting, discarding identity {:?}", peer.id());
                release(Some(subscription), Some(peer), Vec::new());
                return Err(anyhow!("server was stopped while starting").into());
            }
            inner.peer = Some(peer);
            inner.peer_subscription = Some(subscription);
            inner.connection_code = Some(code.clone());
            inner.state = ServerState::Running;
        }

        info!("server listening with connection code {:?}", code);
        self.on_state_change.emit(&ServerState::Running);
        Ok(code)
    }

    fn accept(&self, generation: u64, channel: Arc<dyn DataChannel>) {
        let hosted = {
            let mut inner = self.inner();
            if inner.generation != generation || inner.state != ServerState::Running {
                drop(inner);
                debug!("rejecting data channel from {} - not running", channel.peer_id());
                channel.close();
                return;
            }

            inner.next_connection_id += 1;
            let observer: Weak<dyn HostedConnectionObserver> = self.myself.clone();
            let hosted = HostedConnection::new(inner.next_connection_id, channel, self.connection_config.clone(), observer);
            inner.connecting.push(hosted.clone());
            hosted
        };

        debug!("accepted data channel from {} as connection {}", hosted.peer_id(), hosted.id());
        hosted.begin_handshake();
    }

    /// Releases the listening identity and disconnects all clients, without client
    ///  notifications.
    pub fn stop(&self) {
        let (subscription, peer, clients, changed) = {
            let mut inner = self.inner();
            let (subscription, peer, clients) = inner.take_resources();
            let changed = inner.state != ServerState::Stopped;
            inner.state = ServerState::Stopped;
            (subscription, peer, clients, changed)
        };
        release(subscription, peer, clients);

        if changed {
            info!("server stopped");
            self.on_state_change.emit(&ServerState::Stopped);
        }
    }

    /// removes all listeners of client and state events
    pub fn reset_listeners(&self) {
        self.on_client_connected.unsubscribe_all();
        self.on_client_disconnected.unsubscribe_all();
        self.on_state_change.unsubscribe_all();
    }

    /// connected clients, in the order they connected
    pub fn clients(&self) -> Vec<Arc<HostedConnection>> {
        self.inner().connected.clone()
    }

    pub fn connecting_clients(&self) -> Vec<Arc<HostedConnection>> {
        self.inner().connecting.clone()
    }

    /// the code the server is listening with, while it is running
    pub fn connection_code(&self) -> Option<String> {
        self.inner().connection_code.clone()
    }

    pub fn state(&self) -> ServerState {
        self.inner().state
    }

    pub fn on_client_connected(&self) -> &EventChannel<Arc<HostedConnection>> {
        &self.on_client_connected
    }

    pub fn on_client_disconnected(&self) -> &EventChannel<Arc<HostedConnection>> {
        &self.on_client_disconnected
    }

    pub fn on_state_change(&self) -> &EventChannel<ServerState> {
        &self.on_state_change
    }
}

impl HostedConnectionObserver for Server {
    fn on_hosted_connection_state(&self, connection: &Arc<HostedConnection>, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                let moved = {
                    let mut inner = self.inner();
                    match inner.connecting.iter().position(|c| Arc::ptr_eq(c, connection)) {
                        Some(idx) => {
                            let hosted = inner.connecting.remove(idx);
                            inner.connected.push(hosted);
                            true
                        }
                        None => false,
                    }
                };
                if moved {
                    info!("client {} connected as connection {}", connection.peer_id(), connection.id());
                    self.on_client_connected.emit(connection);
                }
            }
            ConnectionState::Disconnected => {
                let removed = {
                    let mut inner = self.inner();
                    let before = inner.connecting.len() + inner.connected.len();
                    inner.connecting.retain(|c| !Arc::ptr_eq(c, connection));
                    inner.connected.retain(|c| !Arc::ptr_eq(c, connection));
                    before != inner.connecting.len() + inner.connected.len()
                };
                if removed {
                    info!("client {} (connection {}) disconnected", connection.peer_id(), connection.id());
                    self.on_client_disconnected.emit(connection);
                }
            }
        }
    }
}
