use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use crate::messaging::message::Message;
use crate::util::event::EventChannel;

struct TrackerInner {
    pending: FxHashMap<u64, Message>,
    sweep_handle: Option<JoinHandle<()>>,
    /// identifies the current sweep task, a superseded task must not touch the handle
    sweep_generation: u64,
}

impl TrackerInner {
    fn take_expired(&mut self, timeout: Duration, now: Instant) -> Vec<Message> {
        let expired_ids = self.pending.values()
            .filter(|msg| msg.sent_at.map_or(true, |sent_at| sent_at + timeout < now))
            .map(|msg| msg.id)
            .collect::<Vec<_>>();

        expired_ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|mut msg| {
                msg.acknowledged_at = None;
                msg.timed_out = true;
                msg
            })
            .collect()
    }

    fn cancel_sweep(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

/// Keeps track of sent messages until they are either acknowledged by the remote peer or time
///  out.
///
/// Timeouts are detected by a periodic sweep that runs once per timeout window while there are
///  pending messages, so a message can stay pending for up to twice the timeout before it is
///  marked as timed out. Timed-out messages are not resent.
///
/// Resolved messages (acknowledged or timed out) are removed and published on the `on_resolved`
///  event channel passed in by the owner.
#[derive(Clone)]
pub struct PendingTracker {
    timeout: Duration,
    inner: Arc<Mutex<TrackerInner>>,
    on_resolved: EventChannel<Message>,
}

impl PendingTracker {
    pub fn new(timeout: Duration, on_resolved: EventChannel<Message>) -> PendingTracker {
        PendingTracker {
            timeout,
            inner: Arc::new(Mutex::new(TrackerInner {
                pending: Default::default(),
                sweep_handle: None,
                sweep_generation: 0,
            })),
            on_resolved,
        }
    }

    fn inner(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap()
    }

    /// Stamps the message's send time and stores it. The returned copy is a snapshot of the
    ///  pending message.
    pub fn put(&self, mut message: Message) -> Message {
        message.sent_at = Some(Instant::now());
        message.acknowledged_at = None;
        message.timed_out = false;

        let snapshot = message.clone();

        let mut inner = self.inner();
        if inner.pending.insert(message.id, message).is_some() {
            debug!("message id {} was already pending - replacing it", snapshot.id);
        }
        self.ensure_sweep_timer(&mut inner);
        snapshot
    }

    /// Resolves a pending message as acknowledged. An ACK for a message that is not pending
    ///  (typically because it timed out already) is ignored.
    pub fn acknowledge(&self, message_id: u64) -> Option<Message> {
        let acknowledged = {
            let mut inner = self.inner();
            let Some(mut msg) = inner.pending.remove(&message_id) else {
                info!("received ACK for message {} that is not pending - it probably timed out already", message_id);
                return None;
            };
            if inner.pending.is_empty() {
                inner.cancel_sweep();
            }

            msg.acknowledged_at = Some(Instant::now());
            msg.timed_out = false;
            msg
        };

        trace!("message {} acknowledged after {:?}", acknowledged.id, acknowledged.latency());
        self.on_resolved.emit(&acknowledged);
        Some(acknowledged)
    }

    /// Marks all messages as timed out that were sent more than one timeout window ago, and
    ///  removes them. This is what the periodic sweep does.
    pub fn sweep_expired(&self) -> Vec<Message> {
        let timed_out = {
            let mut inner = self.inner();
            let timed_out = inner.take_expired(self.timeout, Instant::now());
            if inner.pending.is_empty() {
                inner.cancel_sweep();
            }
            timed_out
        };
        publish_timed_out(&self.on_resolved, &timed_out);
        timed_out
    }

    fn ensure_sweep_timer(&self, inner: &mut TrackerInner) {
        if inner.sweep_handle.is_some() || inner.pending.is_empty() {
            return;
        }

        inner.sweep_generation += 1;
        let generation = inner.sweep_generation;

        let weak_inner = Arc::downgrade(&self.inner);
        let timeout = self.timeout;
        let on_resolved = self.on_resolved.clone();
        inner.sweep_handle = Some(tokio::spawn(async move {
            run_sweep_timer(weak_inner, generation, timeout, on_resolved).await;
        }));
    }

    /// Stops the sweep timer. Messages that are still pending are abandoned: they are neither
    ///  acknowledged nor timed out.
    pub fn destroy(&self) {
        let mut inner = self.inner();
        inner.cancel_sweep();
        if !inner.pending.is_empty() {
            debug!("abandoning {} pending messages", inner.pending.len());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner().pending.len()
    }

    pub fn is_pending(&self, message_id: u64) -> bool {
        self.inner().pending.contains_key(&message_id)
    }

    /// snapshot, ordered by message id
    pub fn pending_messages(&self) -> Vec<Message> {
        let mut result = self.inner().pending.values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by_key(|msg| msg.id);
        result
    }

    pub fn is_sweep_active(&self) -> bool {
        self.inner().sweep_handle.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn run_sweep_timer(inner: Weak<Mutex<TrackerInner>>, generation: u64, timeout: Duration, on_resolved: EventChannel<Message>) {
    loop {
        sleep(timeout).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let (timed_out, is_done) = {
            let mut inner = inner.lock().unwrap();
            if inner.sweep_handle.is_none() || inner.sweep_generation != generation {
                return;
            }
            let timed_out = inner.take_expired(timeout, Instant::now());
            let is_done = inner.pending.is_empty();
            if is_done {
                // dropping our own handle rather than aborting it: the task ends below
                inner.sweep_handle = None;
            }
            (timed_out, is_done)
        };

        publish_timed_out(&on_resolved, &timed_out);

        if is_done {
            return;
        }
    }
}

fn publish_timed_out(on_resolved: &EventChannel<Message>, timed_out: &[Message]) {
    for msg in timed_out {
        debug!("message {} of type {:?} timed out", msg.id, msg.message_type);
        on_resolved.emit(msg);
    }
}
