//! Push-side fan-out
//!
//! Every subscriber gets its own wait-free SPSC ring and a dispatcher thread
//! that drains it into the listener. The capture thread only ever pushes into
//! rings, so a slow or broken listener can't hold up capture or the other
//! subscribers. If a subscriber falls so far behind that its ring fills up,
//! new packets are dropped for that subscriber only.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    DecryptedPacket, DEFAULT_SUBSCRIBER_CAPACITY,
};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

// Backstop in case an unpark is missed; normally the producer wakes us
const IDLE_PARK: Duration = Duration::from_millis(50);

/// Something that wants every packet pushed to it
pub trait Listener: Send + 'static {
    fn on_packet(&mut self, packet: &DecryptedPacket) -> std::result::Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: FnMut(&DecryptedPacket) -> std::result::Result<(), ListenerError> + Send + 'static,
{
    fn on_packet(&mut self, packet: &DecryptedPacket) -> std::result::Result<(), ListenerError> {
        self(packet)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

struct Subscriber {
    id: u64,
    ring: Producer<DecryptedPacket>,
    dispatcher: JoinHandle<()>,
    dropped: u64,
}

pub struct SubscriberHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    failures: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl SubscriberHub {
    /// `capacity` is the per-subscriber backlog in packets
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
            failures: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe<L: Listener>(&self, listener: L) -> Result<SubscriberHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (producer, consumer) = RingBuffer::new(self.capacity);
        let failures = self.failures.clone();
        let dispatcher = thread::Builder::new()
            .name(format!("subscriber-{}", id))
            .spawn(move || dispatch(id, consumer, listener, failures))
            .map_err(Error::Spawn)?;
        self.lock().push(Subscriber {
            id,
            ring: producer,
            dispatcher,
            dropped: 0,
        });
        debug!(subscriber = id, "Subscribed");
        Ok(SubscriberHandle(id))
    }

    /// Packets already handed to this subscriber are still delivered before
    /// its dispatcher exits. Returns false for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let removed = {
            let mut subs = self.lock();
            subs.iter()
                .position(|s| s.id == handle.0)
                .map(|pos| subs.remove(pos))
        };
        match removed {
            Some(sub) => {
                shutdown(sub);
                debug!(subscriber = handle.0, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Hand `packet` to every current subscriber. Never blocks on a listener.
    pub fn notify(&self, packet: &DecryptedPacket) {
        let mut subs = self.lock();
        for sub in subs.iter_mut() {
            match sub.ring.push(packet.clone()) {
                Ok(()) => sub.dispatcher.thread().unpark(),
                Err(PushError::Full(_)) => {
                    sub.dropped += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if sub.dropped.is_power_of_two() {
                        warn!(
                            subscriber = sub.id,
                            dropped = sub.dropped,
                            "Subscriber is falling behind, dropping packets"
                        );
                    }
                    // Still make sure it's awake to drain what it has
                    sub.dispatcher.thread().unpark();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Listener calls that returned an error or panicked
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Packets dropped because a subscriber's backlog was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        // Nothing panics while holding this lock, but don't let a poisoned
        // lock take the capture thread down with it
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SubscriberHub {
    fn drop(&mut self) {
        let subs = std::mem::take(&mut *self.lock());
        for sub in subs {
            shutdown(sub);
        }
    }
}

fn shutdown(sub: Subscriber) {
    let Subscriber {
        ring, dispatcher, ..
    } = sub;
    // Dropping the producer abandons the ring, which is the dispatcher's cue
    // to drain and exit
    drop(ring);
    dispatcher.thread().unpark();
    // A listener unsubscribing itself can't wait on its own thread
    if dispatcher.thread().id() != thread::current().id() {
        let _ = dispatcher.join();
    }
}

fn dispatch<L: Listener>(
    id: u64,
    mut ring: Consumer<DecryptedPacket>,
    mut listener: L,
    failures: Arc<AtomicU64>,
) {
    loop {
        match ring.pop() {
            Ok(packet) => deliver(id, &mut listener, &packet, &failures),
            Err(_) if ring.is_abandoned() => {
                // Anything pushed between the failed pop and the abandon check
                while let Ok(packet) = ring.pop() {
                    deliver(id, &mut listener, &packet, &failures);
                }
                break;
            }
            Err(_) => thread::park_timeout(IDLE_PARK),
        }
    }
    debug!(subscriber = id, "Dispatcher exiting");
}

fn deliver<L: Listener>(
    id: u64,
    listener: &mut L,
    packet: &DecryptedPacket,
    failures: &AtomicU64,
) {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.on_packet(packet))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = id, sequence = packet.sequence, "Subscriber failed: {}", e);
        }
        Err(_) => {
            failures.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = id, sequence = packet.sequence, "Subscriber panicked");
        }
    }
}
