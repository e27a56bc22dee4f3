use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::Bytes;

use crate::messaging::envelope::Envelope;
use crate::transport::{ChannelEvent, DataChannel};
use crate::util::event::{EventChannel, Listener, Subscription};

/// A [DataChannel] double that records everything sent through it and lets test code inject
///  events as if they came from the remote peer. Events are delivered synchronously on the
///  calling thread.
pub struct TrackingDataChannel {
    peer_id: String,
    open: AtomicBool,
    closed: AtomicBool,
    send_fails: AtomicBool,
    close_on_subscribe: AtomicBool,
    close_count: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    events: EventChannel<ChannelEvent>,
}

impl TrackingDataChannel {
    pub fn new(peer_id: &str) -> Arc<TrackingDataChannel> {
        Arc::new(TrackingDataChannel {
            peer_id: peer_id.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            send_fails: AtomicBool::new(false),
            close_on_subscribe: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            sent: Default::default(),
            events: Default::default(),
        })
    }

    pub fn new_open(peer_id: &str) -> Arc<TrackingDataChannel> {
        let result = TrackingDataChannel::new(peer_id);
        result.set_open(true);
        result
    }

    /// changes the reported state without emitting an event
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_send_fails(&self, send_fails: bool) {
        self.send_fails.store(send_fails, Ordering::SeqCst);
    }

    /// The next call to `on()` closes the channel right after adding the listener, as if the
    ///  remote peer hung up while the channel was being bound.
    pub fn close_on_next_subscribe(&self) {
        self.close_on_subscribe.store(true, Ordering::SeqCst);
    }

    /// Marks the channel as open and emits the `open` event
    pub fn open(&self) {
        self.set_open(true);
        self.emit(ChannelEvent::Open);
    }

    pub fn emit(&self, event: ChannelEvent) {
        self.events.emit(&event);
    }

    /// inject an envelope as if the remote peer had sent it
    pub fn receive(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(buf) => self.emit(ChannelEvent::Data(buf)),
            Err(e) => panic!("envelope can not be encoded: {}", e),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// sent data decoded as envelopes, skipping anything that does not decode
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent().iter()
            .filter_map(|buf| Envelope::try_decode(buf).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }
}

impl DataChannel for TrackingDataChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) -> anyhow::Result<()> {
        if self.send_fails.load(Ordering::SeqCst) {
            bail!("simulated send failure");
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    /// The first call emits `close`, later calls are only counted
    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.set_open(false);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEvent::Close);
        }
    }

    fn on(&self, listener: Listener<ChannelEvent>) -> Subscription<ChannelEvent> {
        let subscription = self.events.subscribe(listener);
        if self.close_on_subscribe.swap(false, Ordering::SeqCst) {
            self.close();
        }
        subscription
    }
}
