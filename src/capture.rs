//! This module contains all the capture logic

// The capture thread does one thing, with as little added latency as we can
// manage: pull frames off the device, decrypt them, and hand the result to the
// packet queue and then the subscribers. Everything else (lifecycle control,
// status) happens on other threads and talks to this one through `Shared`.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::{
    cipher::CipherEngine,
    device::{FrameSource, ReadOutcome},
    error::{Error, Result},
    hub::SubscriberHub,
    monitoring::CaptureStats,
    queue::PacketQueue,
    rate::{RateEstimator, SharedRate},
    session::State,
    DecryptedPacket,
};

/// State shared between a session and its capture thread
#[derive(Debug)]
pub(crate) struct Shared {
    state: AtomicU8,
    pub(crate) rate: SharedRate,
    pub(crate) stats: CaptureStats,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Idle as u8),
            rate: SharedRate::new(),
            stats: CaptureStats::new(),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Atomically move to `to` if the current state satisfies `allowed`.
    /// Returns whether the transition happened.
    pub(crate) fn transition(&self, allowed: impl Fn(State) -> bool, to: State) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                allowed(State::from_u8(s)).then(|| to as u8)
            })
            .is_ok()
    }

    /// The stop request is the state itself, so it can't get out of step
    /// with the lifecycle
    pub(crate) fn stop_requested(&self) -> bool {
        self.state() == State::StopRequested
    }

    /// Clear leftovers from the previous run. Only the winner of the
    /// transition into `Starting` calls this.
    pub(crate) fn prepare_start(&self) {
        *self.last_error() = None;
    }

    /// Last step of every run, successful or not
    pub(crate) fn finish(&self, error: Option<String>) {
        self.rate.store(0.0);
        if error.is_some() {
            *self.last_error() = error;
        }
        self.state.store(State::Stopped as u8, Ordering::SeqCst);
    }

    pub(crate) fn last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where the source lives between runs. The capture thread takes it out for
/// the duration of a run and puts it back before reporting `Stopped`.
pub(crate) type SourceSlot<S> = Arc<Mutex<Option<S>>>;

pub(crate) fn lock_slot<S>(slot: &SourceSlot<S>) -> MutexGuard<'_, Option<S>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one capture run needs
pub(crate) struct Pipeline {
    pub(crate) shared: Arc<Shared>,
    pub(crate) cipher: Arc<CipherEngine>,
    pub(crate) queue: PacketQueue,
    pub(crate) hub: Arc<SubscriberHub>,
    pub(crate) poll_timeout: Duration,
}

/// Wraps a source that has been opened successfully and closes it when this
/// goes out of scope, whichever way the run ends
struct OpenDevice<'a, S: FrameSource>(&'a mut S);

impl<S: FrameSource> Deref for OpenDevice<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.0
    }
}

impl<S: FrameSource> DerefMut for OpenDevice<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.0
    }
}

impl<S: FrameSource> Drop for OpenDevice<'_, S> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Body of the capture thread. Reports the outcome of opening the device on
/// `ready` and then runs until stopped or the device fails.
pub(crate) fn run<S: FrameSource>(
    slot: SourceSlot<S>,
    pipeline: Pipeline,
    ready: Sender<Result<()>>,
) {
    let shared = pipeline.shared.clone();
    let mut source = match lock_slot(&slot).take() {
        Some(source) => source,
        None => {
            shared.finish(Some(Error::WorkerLost.to_string()));
            let _ = ready.send(Err(Error::WorkerLost));
            return;
        }
    };
    let name = source.describe();

    if let Err(e) = source.open() {
        error!(device = %name, "Failed to open device: {}", e);
        source.close();
        *lock_slot(&slot) = Some(source);
        shared.finish(Some(e.to_string()));
        let _ = ready.send(Err(e));
        return;
    }

    shared.stats.record_run();
    // A stop request may have already moved us past Starting
    shared.transition(|s| s == State::Starting, State::Running);
    info!(device = %name, "Capture started");
    let _ = ready.send(Ok(()));
    let result = pipeline.cycle(OpenDevice(&mut source));

    // The device is closed by now, the guard went with the cycle
    *lock_slot(&slot) = Some(source);
    match result {
        Ok(()) => {
            info!(
                device = %name,
                frames = shared.stats.frames(),
                "Capture stopped"
            );
            shared.finish(None);
        }
        Err(e) => {
            error!(device = %name, "Capture failed: {}", e);
            shared.finish(Some(e.to_string()));
        }
    }
}

impl Pipeline {
    fn cycle<S: FrameSource>(&self, mut device: OpenDevice<'_, S>) -> Result<()> {
        let mut rate = RateEstimator::new();
        while !self.shared.stop_requested() {
            match device.read_frame(self.poll_timeout)? {
                ReadOutcome::NoData => {
                    // Nothing within the poll window means the stream stalled
                    self.shared.rate.store(0.0);
                    self.shared.stats.record_idle();
                }
                ReadOutcome::Frame(frame) => {
                    rate.record(frame.received);
                    self.shared.rate.store(rate.current_rate());
                    let packet = DecryptedPacket {
                        data: self.cipher.decrypt(&frame.bytes),
                        sequence: self.shared.stats.record_frame(),
                        received_at: frame.received_at,
                    };
                    if packet.sequence % 1024 == 0 {
                        debug!(
                            sequence = packet.sequence,
                            rate = self.shared.rate.load(),
                            "Capturing"
                        );
                    }
                    self.queue.push(packet.clone());
                    self.hub.notify(&packet);
                }
            }
        }
        Ok(())
    }
}
