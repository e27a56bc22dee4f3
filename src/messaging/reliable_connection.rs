use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::PeerLinkError;
use crate::messaging::connection_config::ConnectionConfig;
use crate::messaging::envelope::Envelope;
use crate::messaging::message::{Message, ReceivedMessage, DISCONNECT_MESSAGE_TYPE, PING_MESSAGE_TYPE};
use crate::messaging::pending_tracker::PendingTracker;
use crate::transport::{ChannelEvent, DataChannel};
use crate::util::event::{EventChannel, Subscription};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// the channel is being opened, or the handshake is not complete yet
    Connecting,
    Connected,
    Disconnected,
}

/// Role-specific reactions to what happens on the bound channel. The close and error hooks are
///  responsible for driving the owning role to [ConnectionState::Disconnected]; they must not
///  panic.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_message(&self, _message: &ReceivedMessage) {}
    fn on_close(&self);
    fn on_error(&self, error: &str);
}

struct ConnectionInner {
    channel: Option<Arc<dyn DataChannel>>,
    channel_subscription: Option<Subscription<ChannelEvent>>,
    /// events from a channel that was unbound in the meantime are ignored
    binding: u64,
    tracker: Option<PendingTracker>,
    last_message_id: u64,
    state: ConnectionState,
    keep_alive: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn cancel_keep_alive(&mut self) {
        if let Some(handle) = self.keep_alive.take() {
            handle.abort();
        }
    }
}

/// Turns one unreliable data channel at a time into an observable message stream: outbound
///  messages get ids and are tracked until they are acknowledged or time out, inbound content
///  is acknowledged and published, and an idle connection sends keep-alive PINGs.
///
/// The connection object outlives the channels bound to it. Message ids keep increasing across
///  rebinding, while the pending tracker is replaced with every binding.
pub struct ReliableConnection {
    config: Arc<ConnectionConfig>,
    myself: Weak<ReliableConnection>,
    handler: Weak<dyn ConnectionHandler>,
    inner: Mutex<ConnectionInner>,
    on_message: EventChannel<ReceivedMessage>,
    on_state_change: EventChannel<ConnectionState>,
    on_message_resolved: EventChannel<Message>,
}

impl ReliableConnection {
    pub fn new(config: Arc<ConnectionConfig>, initial_state: ConnectionState, handler: Weak<dyn ConnectionHandler>) -> Arc<ReliableConnection> {
        Arc::new_cyclic(|myself| ReliableConnection {
            config,
            myself: myself.clone(),
            handler,
            inner: Mutex::new(ConnectionInner {
                channel: None,
                channel_subscription: None,
                binding: 0,
                tracker: None,
                last_message_id: 0,
                state: initial_state,
                keep_alive: None,
            }),
            on_message: Default::default(),
            on_state_change: Default::default(),
            on_message_resolved: Default::default(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap()
    }

    /// Binds a new channel (or none), releasing the previous binding: its listener is removed,
    ///  keep-alive is stopped and its pending tracker is destroyed.
    pub fn register_connection(&self, channel: Option<Arc<dyn DataChannel>>) {
        let (old_subscription, old_tracker, binding) = {
            let mut inner = self.inner();
            inner.cancel_keep_alive();
            inner.channel = None;
            inner.binding += 1;
            (inner.channel_subscription.take(), inner.tracker.take(), inner.binding)
        };
        if let Some(subscription) = old_subscription {
            subscription.dispose();
        }
        if let Some(tracker) = old_tracker {
            tracker.destroy();
        }

        let Some(channel) = channel else {
            trace!("unbound data channel");
            return;
        };
        debug!("binding data channel to {}", channel.peer_id());

        // events may arrive before the binding below is stored, so the listener carries its channel
        let myself = self.myself.clone();
        let bound = channel.clone();
        let subscription = channel.on(Arc::new(move |evt: &ChannelEvent| {
            if let Some(connection) = myself.upgrade() {
                connection.on_channel_event(binding, &bound, evt);
            }
        }));
        let tracker = PendingTracker::new(self.config.message_timeout, self.on_message_resolved.clone());

        let mut inner = self.inner();
        if inner.binding != binding {
            // a concurrent registration won
            drop(inner);
            subscription.dispose();
            return;
        }
        inner.channel = Some(channel);
        inner.channel_subscription = Some(subscription);
        inner.tracker = Some(tracker);
    }

    /// Sends a message and starts tracking it. Transmission is fire-and-forget, the returned
    ///  message is a snapshot taken when it was handed to the tracker; its resolution is
    ///  published on [ReliableConnection::on_message_resolved].
    pub fn send_message(&self, message_type: &str, payload: Value) -> Result<Message, PeerLinkError> {
        let (channel, message) = {
            let mut inner = self.inner();
            let channel = match &inner.channel {
                Some(channel) if channel.is_open() => channel.clone(),
                _ => return Err(PeerLinkError::ChannelClosed),
            };
            let Some(tracker) = inner.tracker.clone() else {
                return Err(PeerLinkError::TrackerMissing);
            };

            inner.last_message_id += 1;
            let message = tracker.put(Message::new(inner.last_message_id, message_type, payload));
            (channel, message)
        };

        trace!("sending message {} of type {:?} to {}", message.id, message.message_type, channel.peer_id());
        match Envelope::for_message(&message).encode() {
            Ok(buf) => {
                if let Err(e) = channel.send(buf) {
                    warn!("error sending message {} to {}: {} - it will time out", message.id, channel.peer_id(), e);
                }
            }
            Err(e) => warn!("error encoding message {}: {} - it will time out", message.id, e),
        }

        self.reset_keep_alive();
        Ok(message)
    }

    fn reset_keep_alive(&self) {
        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };

        let mut inner = self.inner();
        inner.cancel_keep_alive();
        if inner.channel.is_none() {
            return;
        }

        let myself = self.myself.clone();
        inner.keep_alive = Some(tokio::spawn(async move {
            sleep(interval).await;
            if let Some(connection) = myself.upgrade() {
                trace!("connection idle for {:?}, sending keep-alive", interval);
                if let Err(e) = connection.send_message(PING_MESSAGE_TYPE, Value::Null) {
                    debug!("keep-alive not sent: {}", e);
                }
            }
        }));
    }

    fn on_channel_event(&self, binding: u64, channel: &Arc<dyn DataChannel>, evt: &ChannelEvent) {
        if self.inner().binding != binding {
            trace!("ignoring event from a data channel that is no longer bound");
            return;
        }

        match evt {
            ChannelEvent::Data(buf) => self.on_data(channel, buf),
            ChannelEvent::Open => {}
            ChannelEvent::Close => {
                debug!("data channel to {} was closed", channel.peer_id());
                self.inner().cancel_keep_alive();
                if let Some(handler) = self.handler.upgrade() {
                    handler.on_close();
                }
            }
            ChannelEvent::Error(e) => {
                debug!("error on data channel to {}: {}", channel.peer_id(), e);
                self.inner().cancel_keep_alive();
                if let Some(handler) = self.handler.upgrade() {
                    handler.on_error(e);
                }
            }
        }
    }

    fn on_data(&self, channel: &Arc<dyn DataChannel>, buf: &[u8]) {
        let envelope = match Envelope::try_decode(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed envelope from {}: {}", channel.peer_id(), e);
                return;
            }
        };

        match envelope {
            Envelope::Ack { id } => {
                let tracker = self.inner().tracker.clone();
                if let Some(tracker) = tracker {
                    tracker.acknowledge(id);
                }
            }
            Envelope::Content { id, message_type, payload } => {
                match (Envelope::Ack { id }).encode() {
                    Ok(ack) => {
                        if let Err(e) = channel.send(ack) {
                            warn!("error acknowledging message {} from {}: {}", id, channel.peer_id(), e);
                        }
                    }
                    Err(e) => warn!("error encoding ACK for message {}: {}", id, e),
                }

                match message_type.as_str() {
                    PING_MESSAGE_TYPE => {}
                    DISCONNECT_MESSAGE_TYPE => {
                        debug!("{} asked to disconnect", channel.peer_id());
                        channel.close();
                    }
                    _ => {
                        let message = ReceivedMessage { id, message_type, payload };
                        self.on_message.emit(&message);
                        if let Some(handler) = self.handler.upgrade() {
                            handler.on_message(&message);
                        }
                    }
                }
            }
        }
    }

    /// Closes the bound channel. With [ConnectionConfig::graceful_disconnect], a DISCONNECT
    ///  message is sent first on a best-effort basis.
    pub fn disconnect(&self) {
        let Some(channel) = self.channel() else {
            debug!("disconnect without a bound data channel");
            return;
        };

        if self.config.graceful_disconnect && channel.is_open() {
            if let Err(e) = self.send_message(DISCONNECT_MESSAGE_TYPE, Value::Null) {
                debug!("disconnect notice not sent: {}", e);
            }
        }
        channel.close();
    }

    /// Sets the state, emitting a state change event if it actually changed
    pub fn transition(&self, state: ConnectionState) -> bool {
        let prev = {
            let mut inner = self.inner();
            std::mem::replace(&mut inner.state, state)
        };
        if prev == state {
            return false;
        }
        debug!("connection state {:?} -> {:?}", prev, state);
        self.on_state_change.emit(&state);
        true
    }

    /// Changes the state to `new_state` only if it currently is `expected`
    pub fn compare_and_set_state(&self, expected: ConnectionState, new_state: ConnectionState) -> bool {
        {
            let mut inner = self.inner();
            if inner.state != expected {
                return false;
            }
            if expected == new_state {
                return true;
            }
            inner.state = new_state;
        }
        debug!("connection state {:?} -> {:?}", expected, new_state);
        self.on_state_change.emit(&new_state);
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    /// a channel is bound and reports being open
    pub fn is_connected(&self) -> bool {
        self.inner().channel.as_ref()
            .map_or(false, |channel| channel.is_open())
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// number of messages sent over the lifetime of this object, which is also the last id used
    pub fn total_message_count(&self) -> u64 {
        self.inner().last_message_id
    }

    pub fn pending_count(&self) -> usize {
        self.inner().tracker.as_ref()
            .map_or(0, |tracker| tracker.pending_count())
    }

    pub fn pending_messages(&self) -> Vec<Message> {
        self.inner().tracker.as_ref()
            .map(|tracker| tracker.pending_messages())
            .unwrap_or_default()
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.inner().channel.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn on_message(&self) -> &EventChannel<ReceivedMessage> {
        &self.on_message
    }

    pub fn on_state_change(&self) -> &EventChannel<ConnectionState> {
        &self.on_state_change
    }

    pub fn on_message_resolved(&self) -> &EventChannel<Message> {
        &self.on_message_resolved
    }
}

impl Drop for ReliableConnection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.cancel_keep_alive();
        if let Some(tracker) = inner.tracker.take() {
            tracker.destroy();
        }
        if let Some(subscription) = inner.channel_subscription.take() {
            subscription.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::test_util::channel::TrackingDataChannel;
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<ReceivedMessage>>,
        closed: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }
    impl ConnectionHandler for RecordingHandler {
        fn on_message(&self, message: &ReceivedMessage) {
            self.received.lock().unwrap().push(message.clone());
        }
        fn on_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn weak_handler(handler: &Arc<RecordingHandler>) -> Weak<dyn ConnectionHandler> {
        let weak: Weak<RecordingHandler> = Arc::downgrade(handler);
        weak
    }

    fn connection_with_config(config: ConnectionConfig) -> (Arc<ReliableConnection>, Arc<RecordingHandler>, Arc<TrackingDataChannel>) {
        let handler = Arc::new(RecordingHandler::default());
        let connection = ReliableConnection::new(Arc::new(config), ConnectionState::Connected, weak_handler(&handler));

        let channel = TrackingDataChannel::new_open("remote");
        connection.register_connection(Some(channel.clone()));
        (connection, handler, channel)
    }

    fn connection() -> (Arc<ReliableConnection>, Arc<RecordingHandler>, Arc<TrackingDataChannel>) {
        connection_with_config(ConnectionConfig::default())
    }

    fn content(id: u64, message_type: &str, payload: Value) -> ChannelEvent {
        let envelope = Envelope::Content { id, message_type: message_type.to_string(), payload };
        ChannelEvent::Data(envelope.encode().unwrap())
    }

    #[rstest]
    #[case::one(1)]
    #[case::several(5)]
    #[tokio::test(start_paused = true)]
    async fn test_send_message_ids(#[case] num_messages: u64) {
        let (connection, _handler, channel) = connection();

        for expected_id in 1..=num_messages {
            let msg = connection.send_message("greet", json!({"n": expected_id})).unwrap();
            assert_eq!(msg.id, expected_id);
            assert!(msg.sent_at.is_some());
        }

        assert_eq!(connection.total_message_count(), num_messages);
        assert_eq!(connection.pending_count(), num_messages as usize);

        let sent_ids = channel.sent_envelopes().into_iter()
            .map(|envelope| match envelope {
                Envelope::Content { id, .. } => id,
                Envelope::Ack { .. } => panic!("unexpected ACK"),
            })
            .collect::<Vec<_>>();
        assert_eq!(sent_ids, (1..=num_messages).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_unbound() {
        let handler = Arc::new(RecordingHandler::default());
        let connection = ReliableConnection::new(Arc::new(ConnectionConfig::default()), ConnectionState::Disconnected, weak_handler(&handler));

        assert!(matches!(connection.send_message("greet", Value::Null), Err(PeerLinkError::ChannelClosed)));
        assert_eq!(connection.total_message_count(), 0);
        assert!(!connection.is_connected());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_channel_not_open() {
        let (connection, _handler, channel) = connection();
        connection.send_message("a", Value::Null).unwrap();

        channel.set_open(false);
        assert!(matches!(connection.send_message("b", Value::Null), Err(PeerLinkError::ChannelClosed)));
        assert_eq!(connection.total_message_count(), 1);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_still_tracked() {
        let (connection, _handler, channel) = connection();
        channel.set_send_fails(true);

        let msg = connection.send_message("a", Value::Null).unwrap();
        assert_eq!(msg.id, 1);
        assert_eq!(connection.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_content() {
        let (connection, handler, channel) = connection();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let _subscription = connection.on_message().subscribe(Arc::new(move |msg: &ReceivedMessage| events2.lock().unwrap().push(msg.clone())));

        channel.emit(content(7, "greet", json!({"text": "hi"})));

        let expected = ReceivedMessage { id: 7, message_type: "greet".to_string(), payload: json!({"text": "hi"}) };
        assert_eq!(channel.sent_envelopes(), vec![Envelope::Ack { id: 7 }]);
        assert_eq!(*events.lock().unwrap(), vec![expected.clone()]);
        assert_eq!(*handler.received.lock().unwrap(), vec![expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_ping() {
        let (connection, handler, channel) = connection();

        channel.emit(content(3, PING_MESSAGE_TYPE, Value::Null));

        assert_eq!(channel.sent_envelopes(), vec![Envelope::Ack { id: 3 }]);
        assert!(handler.received.lock().unwrap().is_empty());
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_disconnect() {
        let (connection, handler, channel) = connection();

        channel.emit(content(4, DISCONNECT_MESSAGE_TYPE, Value::Null));

        assert_eq!(channel.sent_envelopes(), vec![Envelope::Ack { id: 4 }]);
        assert_eq!(channel.close_count(), 1);
        assert!(!connection.is_connected());
        assert!(handler.received.lock().unwrap().is_empty());
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case::no_type(br#"{"id":1,"data":"x"}"#.as_slice())]
    #[case::garbage(b"\x00\x01".as_slice())]
    #[tokio::test(start_paused = true)]
    async fn test_receive_malformed(#[case] buf: &[u8]) {
        let (_connection, handler, channel) = connection();

        channel.emit(ChannelEvent::Data(bytes::Bytes::copy_from_slice(buf)));

        assert!(channel.sent().is_empty());
        assert!(handler.received.lock().unwrap().is_empty());
        assert_eq!(handler.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_ack() {
        let (connection, _handler, channel) = connection();

        let resolved = Arc::new(Mutex::new(Vec::new()));
        let resolved2 = resolved.clone();
        let _subscription = connection.on_message_resolved().subscribe(Arc::new(move |msg: &Message| resolved2.lock().unwrap().push(msg.clone())));

        connection.send_message("a", Value::Null).unwrap();
        connection.send_message("b", Value::Null).unwrap();
        sleep(Duration::from_millis(20)).await;

        channel.emit(ChannelEvent::Data(Envelope::Ack { id: 2 }.encode().unwrap()));

        assert_eq!(connection.pending_count(), 1);
        assert_eq!(connection.pending_messages()[0].id, 1);

        let resolved = resolved.lock().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 2);
        assert!(!resolved[0].timed_out);
        assert_eq!(resolved[0].latency(), Some(Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_after_idle() {
        let (connection, _handler, channel) = connection();
        connection.send_message("a", Value::Null).unwrap();

        sleep(Duration::from_millis(79)).await;
        assert_eq!(channel.sent().len(), 1);

        sleep(Duration::from_millis(2)).await;
        let sent = channel.sent_envelopes();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], Envelope::Content { id: 2, message_type: PING_MESSAGE_TYPE.to_string(), payload: Value::Null });

        // the PING itself re-arms the timer
        sleep(Duration::from_millis(80)).await;
        assert_eq!(channel.sent().len(), 3);
        assert_eq!(connection.total_message_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_is_debounced() {
        let (connection, _handler, channel) = connection();
        connection.send_message("a", Value::Null).unwrap();
        sleep(Duration::from_millis(50)).await;
        connection.send_message("b", Value::Null).unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.sent().len(), 2);

        sleep(Duration::from_millis(40)).await;
        assert_eq!(channel.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_disabled() {
        let mut config = ConnectionConfig::default();
        config.keep_alive_interval = None;
        let (connection, _handler, channel) = connection_with_config(config);

        connection.send_message("a", Value::Null).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_keep_alive() {
        let (connection, handler, channel) = connection();
        connection.send_message("a", Value::Null).unwrap();

        channel.emit(ChannelEvent::Close);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_binding_invokes_hook() {
        let handler = Arc::new(RecordingHandler::default());
        let connection = ReliableConnection::new(Arc::new(ConnectionConfig::default()), ConnectionState::Connected, weak_handler(&handler));
        let channel = TrackingDataChannel::new_open("remote");
        channel.close_on_next_subscribe();

        connection.register_connection(Some(channel.clone()));

        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_with_poisoned_lock() {
        let (connection, _handler, channel) = connection();
        let poisoner = connection.clone();
        let _ = std::thread::spawn(move || {
            let _inner = poisoner.inner.lock().unwrap();
            panic!("poisoning the connection lock");
        }).join();
        assert!(connection.inner.is_poisoned());

        drop(connection);

        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_invokes_hook() {
        let (_connection, handler, channel) = connection();

        channel.emit(ChannelEvent::Error("ice failed".to_string()));

        assert_eq!(*handler.errors.lock().unwrap(), vec!["ice failed".to_string()]);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_keeps_ids() {
        let (connection, handler, first) = connection();
        connection.send_message("a", Value::Null).unwrap();
        connection.send_message("b", Value::Null).unwrap();

        let second = TrackingDataChannel::new_open("remote");
        connection.register_connection(Some(second.clone()));

        assert_eq!(first.listener_count(), 0);
        assert_eq!(second.listener_count(), 1);
        assert_eq!(connection.pending_count(), 0);

        let msg = connection.send_message("c", Value::Null).unwrap();
        assert_eq!(msg.id, 3);
        assert_eq!(second.sent().len(), 1);

        first.emit(content(1, "stale", Value::Null));
        assert!(handler.received.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbind() {
        let (connection, _handler, channel) = connection();
        connection.send_message("a", Value::Null).unwrap();

        connection.register_connection(None);
        connection.register_connection(None);

        assert_eq!(channel.listener_count(), 0);
        assert!(connection.channel().is_none());
        assert_eq!(connection.pending_count(), 0);
        assert!(matches!(connection.send_message("b", Value::Null), Err(PeerLinkError::ChannelClosed)));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.sent().len(), 1);
    }

    #[rstest]
    #[case::plain(false, 0)]
    #[case::graceful(true, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_disconnect(#[case] graceful: bool, #[case] expected_sent: usize) {
        let mut config = ConnectionConfig::default();
        config.graceful_disconnect = graceful;
        let (connection, handler, channel) = connection_with_config(config);

        connection.disconnect();

        let sent = channel.sent_envelopes();
        assert_eq!(sent.len(), expected_sent);
        if graceful {
            assert!(matches!(&sent[0], Envelope::Content { message_type, .. } if message_type == DISCONNECT_MESSAGE_TYPE));
        }
        assert_eq!(channel.close_count(), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transition_emits_only_on_change() {
        let handler = Arc::new(RecordingHandler::default());
        let connection = ReliableConnection::new(Arc::new(ConnectionConfig::default()), ConnectionState::Connecting, weak_handler(&handler));

        let states = Arc::new(Mutex::new(Vec::new()));
        let states2 = states.clone();
        let _subscription = connection.on_state_change().subscribe(Arc::new(move |s: &ConnectionState| states2.lock().unwrap().push(*s)));

        assert!(connection.is_connecting());
        assert!(!connection.transition(ConnectionState::Connecting));
        assert!(connection.transition(ConnectionState::Connected));
        assert!(!connection.compare_and_set_state(ConnectionState::Connecting, ConnectionState::Disconnected));
        assert!(connection.compare_and_set_state(ConnectionState::Connected, ConnectionState::Disconnected));
        assert!(connection.is_disconnected());

        assert_eq!(*states.lock().unwrap(), vec![ConnectionState::Connected, ConnectionState::Disconnected]);
    }
}
