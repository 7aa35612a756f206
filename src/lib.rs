//! Capture, decrypt and fan out sample frames from an encrypted EEG headset
//! device node.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub mod capture;
pub mod cipher;
pub mod device;
pub mod error;
pub mod hub;
pub mod monitoring;
pub mod queue;
pub mod rate;
pub mod session;

pub use cipher::{CipherEngine, KeySchedule};
pub use device::{DeviceChannel, FrameSource, ReadOutcome};
pub use error::{Error, Result};
pub use hub::{Listener, ListenerError, SubscriberHandle, SubscriberHub};
pub use monitoring::{CaptureStats, SessionStatus};
pub use queue::{Empty, PacketQueue, QueueMode};
pub use rate::{RateEstimator, SharedRate};
pub use session::{CaptureConfig, Session, State};

/// Bytes per frame off the device
pub const FRAME_SIZE: usize = 32;
/// AES block size, each frame is two of these
pub const BLOCK_SIZE: usize = 16;
/// Number of arrival timestamps the rate estimator keeps
pub const RATE_WINDOW: usize = 128;
/// Nominal headset sample rate
pub const NOMINAL_RATE_HZ: f64 = 128.0;

pub const DEFAULT_DEVICE_PATH: &str = "/dev/eeg/encrypted";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Once a frame has started, each remaining chunk must show up within this
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

pub type FrameBytes = [u8; FRAME_SIZE];

/// One encrypted frame as it came off the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub bytes: FrameBytes,
    /// Monotonic arrival time, used for rate estimation
    pub received: Instant,
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(bytes: FrameBytes) -> Self {
        Self {
            bytes,
            received: Instant::now(),
            received_at: Utc::now(),
        }
    }
}

/// A decrypted frame. The payload is opaque at this layer; decoding it into
/// channel values happens downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedPacket {
    pub data: FrameBytes,
    /// Position in the session's arrival order, starting at zero
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}
