//! Capture session lifecycle
//!
//! A [`Session`] owns everything for one headset: the frame source, the
//! cipher, the packet queue and the subscriber hub. Its state machine is
//!
//! ```text
//! Idle -> Starting -> Running -> StopRequested -> Stopped
//!                \______________________________/  |
//!                     (open or read failure)       |
//!         ^----------------- start() --------------'
//! ```
//!
//! Every transition is a compare-and-set on one atomic, so any number of
//! threads can call [`Session::start`] and [`Session::stop`] at once and at
//! most one capture thread ever runs.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::bounded;
use tracing::{debug, error};

use crate::{
    capture::{self, lock_slot, Pipeline, Shared, SourceSlot},
    cipher::{CipherEngine, KeySchedule},
    device::{DeviceChannel, FrameSource},
    error::{Error, Result},
    hub::{Listener, SubscriberHandle, SubscriberHub},
    monitoring::{CaptureStats, SessionStatus},
    queue::{Empty, PacketQueue, QueueMode},
    DecryptedPacket, DEFAULT_POLL_TIMEOUT, DEFAULT_SUBSCRIBER_CAPACITY,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle = 0,
    Starting = 1,
    Running = 2,
    StopRequested = 3,
    Stopped = 4,
}

impl State {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Idle,
            1 => State::Starting,
            2 => State::Running,
            3 => State::StopRequested,
            _ => State::Stopped,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// How long one poll of the device waits before counting as a stall.
    /// This also bounds how long a stop request takes to be noticed.
    pub poll_timeout: Duration,
    pub queue_mode: QueueMode,
    /// Backlog each subscriber may build up before packets are dropped for it
    pub subscriber_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            queue_mode: QueueMode::Unbounded,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

pub struct Session<S: FrameSource = DeviceChannel> {
    shared: Arc<Shared>,
    cipher: Arc<CipherEngine>,
    queue: PacketQueue,
    hub: Arc<SubscriberHub>,
    poll_timeout: Duration,
    source: SourceSlot<S>,
    // Also serializes start() against stop()
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session<DeviceChannel> {
    /// Session for the device node at `path`, keyed from the headset serial
    pub fn open_device(
        path: impl AsRef<Path>,
        serial: &str,
        schedule: KeySchedule,
        config: CaptureConfig,
    ) -> Result<Self> {
        let cipher = CipherEngine::new(serial, schedule)?;
        Ok(Self::new(DeviceChannel::new(path), cipher, config))
    }
}

impl<S: FrameSource> Session<S> {
    pub fn new(source: S, cipher: CipherEngine, config: CaptureConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            cipher: Arc::new(cipher),
            queue: PacketQueue::new(config.queue_mode),
            hub: Arc::new(SubscriberHub::new(config.subscriber_capacity)),
            poll_timeout: config.poll_timeout,
            source: Arc::new(Mutex::new(Some(source))),
            worker: Mutex::new(None),
        }
    }

    /// Start capturing. Returns once the device is open (or failed to open).
    /// Calling this while a run is already starting, running or stopping
    /// does nothing.
    pub fn start(&self) -> Result<()> {
        // Held until the device is open, so start and stop never interleave
        let mut worker = self.lock_worker();
        if !self.shared.transition(
            |s| matches!(s, State::Idle | State::Stopped),
            State::Starting,
        ) {
            debug!(state = ?self.state(), "Capture already active, ignoring start");
            return Ok(());
        }
        self.shared.prepare_start();

        // The previous capture thread has already reported Stopped, so this
        // doesn't wait long
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                error!("Previous capture thread panicked");
            }
        }
        if lock_slot(&self.source).is_none() {
            self.shared.finish(Some(Error::WorkerLost.to_string()));
            return Err(Error::WorkerLost);
        }

        let (ready_tx, ready_rx) = bounded(1);
        let pipeline = Pipeline {
            shared: self.shared.clone(),
            cipher: self.cipher.clone(),
            queue: self.queue.clone(),
            hub: self.hub.clone(),
            poll_timeout: self.poll_timeout,
        };
        let slot = self.source.clone();
        let handle = thread::Builder::new()
            .name("eeg-capture".to_owned())
            .spawn(move || capture::run(slot, pipeline, ready_tx));
        match handle {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                self.shared.finish(Some(e.to_string()));
                return Err(Error::Spawn(e));
            }
        }

        match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => {
                // The thread died without reporting, don't leave us stuck in
                // Starting
                self.shared.finish(Some(Error::WorkerLost.to_string()));
                Err(Error::WorkerLost)
            }
        }
    }

    /// Ask the capture thread to stop without waiting for it. The thread
    /// checks between frames, so this takes effect within one poll timeout.
    pub fn request_stop(&self) {
        if self.shared.transition(
            |s| matches!(s, State::Starting | State::Running),
            State::StopRequested,
        ) {
            debug!("Stop requested");
        }
    }

    /// Stop capturing and wait for the capture thread to exit. The device is
    /// closed by the time this returns. Harmless to call when not running.
    pub fn stop(&self) {
        let mut worker = self.lock_worker();
        self.request_stop();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Latest samples-per-second estimate
    pub fn rate(&self) -> f64 {
        self.shared.rate.load()
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.shared.stats
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            rate_hz: self.rate(),
            frames: self.shared.stats.frames(),
            idle_polls: self.shared.stats.idle_polls(),
            queue_len: self.queue.len(),
            queue_dropped: self.queue.dropped(),
            subscribers: self.hub.len(),
            subscriber_failures: self.hub.failures(),
            subscriber_dropped: self.hub.dropped(),
            last_error: self.shared.last_error().clone(),
        }
    }

    /// Handle on the pull queue, clone it out to as many consumers as needed
    pub fn queue(&self) -> PacketQueue {
        self.queue.clone()
    }

    pub fn pull(&self, timeout: Duration) -> std::result::Result<DecryptedPacket, Empty> {
        self.queue.pull(timeout)
    }

    pub fn subscribe<L: Listener>(&self, listener: L) -> Result<SubscriberHandle> {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        self.hub.unsubscribe(handle)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: FrameSource> Drop for Session<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
