use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::{ChannelEvent, DataChannel, Peer, PeerNetwork};
use crate::util::event::{EventChannel, Listener, Subscription};

struct NetworkInner {
    peers: FxHashMap<String, Weak<LocalPeer>>,
    next_anonymous_id: u64,
    unreachable: bool,
}

/// An in-process [PeerNetwork]: identities live in a shared registry, and channels between them
///  are in-memory queues. Each channel end delivers its events in order on a Tokio task of its
///  own, so listeners never run inside the `send` or `close` call that caused them.
///
/// Requires a Tokio runtime.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    dropping: Arc<AtomicBool>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        LocalNetwork::new()
    }
}

impl LocalNetwork {
    pub fn new() -> LocalNetwork {
        LocalNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                peers: Default::default(),
                next_anonymous_id: 1,
                unreachable: false,
            })),
            dropping: Default::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap()
    }

    /// While set, opening an identity fails as if the signalling server could not be reached
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner().unreachable = unreachable;
    }

    /// While set, all data sent on any channel is silently lost. Open / close events are still
    ///  delivered.
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner().peers.get(id)
            .map_or(false, |peer| peer.strong_count() > 0)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut result = self.inner().peers.iter()
            .filter(|(_, peer)| peer.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    fn lookup(&self, id: &str) -> Option<Arc<LocalPeer>> {
        self.inner().peers.get(id)
            .and_then(|peer| peer.upgrade())
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn open_peer(&self, id: Option<String>) -> anyhow::Result<Arc<dyn Peer>> {
        let mut inner = self.inner();
        if inner.unreachable {
            bail!("signalling network is unreachable");
        }

        let id = match id {
            Some(id) => {
                if inner.peers.get(&id).map_or(false, |peer| peer.strong_count() > 0) {
                    bail!("id {:?} is taken", id);
                }
                id
            }
            None => {
                let id = format!("anonymous-{}", inner.next_anonymous_id);
                inner.next_anonymous_id += 1;
                id
            }
        };

        let peer = Arc::new_cyclic(|myself| LocalPeer {
            id: id.clone(),
            myself: myself.clone(),
            network: self.clone(),
            on_connection: Default::default(),
            channels: Default::default(),
            destroyed: AtomicBool::new(false),
        });
        inner.peers.insert(id.clone(), Arc::downgrade(&peer));
        debug!("registered peer {:?}", id);
        Ok(peer)
    }
}

pub struct LocalPeer {
    id: String,
    myself: Weak<LocalPeer>,
    network: LocalNetwork,
    on_connection: EventChannel<Arc<dyn DataChannel>>,
    /// channel ends of this identity, kept alive until they are closed
    channels: Mutex<Vec<Arc<LocalChannel>>>,
    destroyed: AtomicBool,
}

impl LocalPeer {
    fn track(&self, channel: &Arc<LocalChannel>) {
        let mut channels = self.channels.lock().unwrap();
        channels.retain(|c| c.state() != LocalChannelState::Closed);
        channels.push(channel.clone());
    }

    fn unregister(&self) {
        let mut inner = self.network.inner();
        let is_mine = inner.peers.get(&self.id)
            .map_or(false, |peer| peer.ptr_eq(&self.myself));
        if is_mine {
            inner.peers.remove(&self.id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Peer for LocalPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self, remote_id: &str) -> anyhow::Result<Arc<dyn DataChannel>> {
        if self.is_destroyed() {
            bail!("peer {:?} was destroyed", self.id);
        }

        let local_end = LocalChannel::new(remote_id, self.network.dropping.clone());
        self.track(&local_end);

        let Some(remote) = self.network.lookup(remote_id) else {
            debug!("{:?} tried to connect to unknown peer {:?}", self.id, remote_id);
            local_end.deliver(ChannelEvent::Error(format!("could not connect to peer {}", remote_id)));
            return Ok(local_end);
        };

        let remote_end = LocalChannel::new(&self.id, self.network.dropping.clone());
        remote.track(&remote_end);
        *local_end.remote.lock().unwrap() = Arc::downgrade(&remote_end);
        *remote_end.remote.lock().unwrap() = Arc::downgrade(&local_end);

        let initiator = local_end.clone();
        tokio::spawn(async move {
            trace!("announcing channel from {:?} to {:?}", remote_end.peer_id, initiator.peer_id);
            let announced: Arc<dyn DataChannel> = remote_end.clone();
            remote.on_connection.emit(&announced);
            remote_end.mark_open();
            initiator.mark_open();
        });

        Ok(local_end)
    }

    fn on_connection(&self, listener: Listener<Arc<dyn DataChannel>>) -> Subscription<Arc<dyn DataChannel>> {
        self.on_connection.subscribe(listener)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("destroying peer {:?}", self.id);
        self.unregister();
        self.on_connection.unsubscribe_all();

        let channels = std::mem::take(&mut *self.channels.lock().unwrap());
        for channel in channels {
            channel.close();
        }
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LocalChannelState {
    Connecting,
    Open,
    Closed,
}

/// One end of an in-memory duplex channel
pub struct LocalChannel {
    peer_id: String,
    remote: Mutex<Weak<LocalChannel>>,
    state: Mutex<LocalChannelState>,
    events: EventChannel<ChannelEvent>,
    queue: mpsc::UnboundedSender<ChannelEvent>,
    dropping: Arc<AtomicBool>,
}

impl LocalChannel {
    fn new(peer_id: &str, dropping: Arc<AtomicBool>) -> Arc<LocalChannel> {
        let (queue, mut receiver) = mpsc::unbounded_channel::<ChannelEvent>();
        let events = EventChannel::new();

        let pump_events = events.clone();
        tokio::spawn(async move {
            while let Some(evt) = receiver.recv().await {
                pump_events.emit(&evt);
            }
        });

        Arc::new(LocalChannel {
            peer_id: peer_id.to_string(),
            remote: Default::default(),
            state: Mutex::new(LocalChannelState::Connecting),
            events,
            queue,
            dropping,
        })
    }

    fn deliver(&self, evt: ChannelEvent) {
        let _ = self.queue.send(evt);
    }

    fn state(&self) -> LocalChannelState {
        *self.state.lock().unwrap()
    }

    fn mark_open(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LocalChannelState::Connecting {
                return;
            }
            *state = LocalChannelState::Open;
        }
        self.deliver(ChannelEvent::Open);
    }

    /// returns `true` if this call closed the channel
    fn mark_closed(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == LocalChannelState::Closed {
                return false;
            }
            *state = LocalChannelState::Closed;
        }
        self.deliver(ChannelEvent::Close);
        true
    }
}

impl DataChannel for LocalChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.state() == LocalChannelState::Open
    }

    fn send(&self, data: Bytes) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("channel to {:?} is not open", self.peer_id);
        }
        if self.dropping.load(Ordering::SeqCst) {
            trace!("dropping {} bytes to {:?}", data.len(), self.peer_id);
            return Ok(());
        }

        let remote = self.remote.lock().unwrap().upgrade()
            .ok_or_else(|| anyhow!("remote end of the channel to {:?} is gone", self.peer_id))?;
        remote.deliver(ChannelEvent::Data(data));
        Ok(())
    }

    fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        let remote = self.remote.lock().unwrap().upgrade();
        if let Some(remote) = remote {
            remote.mark_closed();
        }
    }

    fn on(&self, listener: Listener<ChannelEvent>) -> Subscription<ChannelEvent> {
        self.events.subscribe(listener)
    }
}
