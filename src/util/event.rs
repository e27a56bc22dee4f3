use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// A listener is shared rather than boxed so that emitting can work on a snapshot of the
///  registered listeners without holding the lock while they run.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

struct Listeners<T> {
    next_id: u64,
    persistent: Vec<(ListenerId, Listener<T>)>,
    once: Vec<Listener<T>>,
}

/// Typed publish / subscribe primitive. Cloning an [EventChannel] yields another handle to the
///  same set of listeners.
///
/// Listeners are invoked synchronously on the emitting thread, persistent listeners first (in
///  subscription order), then all pending one-shot listeners. Emission iterates over a snapshot,
///  so a listener may subscribe or dispose (itself or others) while an event is being emitted;
///  such changes take effect with the next event.
pub struct EventChannel<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        EventChannel {
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventChannel<T> {
    pub fn new() -> EventChannel<T> {
        EventChannel {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                persistent: Vec::new(),
                once: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Listeners<T>> {
        self.listeners.lock().unwrap()
    }

    pub fn subscribe(&self, listener: Listener<T>) -> Subscription<T> {
        let mut listeners = self.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.persistent.push((id, listener));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// The listener fires for the next emitted event only. There is no handle to remove it
    ///  before that, except for [EventChannel::unsubscribe_all].
    pub fn subscribe_once(&self, listener: Listener<T>) {
        self.lock().once.push(listener);
    }

    pub fn emit(&self, event: &T) {
        let (persistent, once) = {
            let mut listeners = self.lock();
            let persistent = listeners.persistent.iter()
                .map(|(_, l)| l.clone())
                .collect::<Vec<_>>();
            (persistent, std::mem::take(&mut listeners.once))
        };

        for listener in persistent.iter().chain(once.iter()) {
            listener(event);
        }
    }

    pub fn unsubscribe_all(&self) {
        let mut listeners = self.lock();
        listeners.persistent.clear();
        listeners.once.clear();
    }

    pub fn listener_count(&self) -> usize {
        let listeners = self.lock();
        listeners.persistent.len() + listeners.once.len()
    }
}

impl<T: 'static> EventChannel<T> {
    /// Forward every event emitted here to `target`. Disposing the returned subscription stops
    ///  the forwarding.
    pub fn pipe(&self, target: &EventChannel<T>) -> Subscription<T> {
        let target = target.clone();
        self.subscribe(Arc::new(move |event: &T| target.emit(event)))
    }
}

/// Handle for a persistent listener. Dropping it leaves the listener registered, it is removed
///  only by [Subscription::dispose].
pub struct Subscription<T> {
    id: ListenerId,
    listeners: Weak<Mutex<Listeners<T>>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn dispose(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().unwrap()
                .persistent.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription({:?})", self.id)
    }
}
