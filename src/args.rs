//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use eeg_slurper::{CaptureConfig, KeySchedule, QueueMode, DEFAULT_SUBSCRIBER_CAPACITY};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Headset serial number, the decryption key is derived from it
    #[clap(short, long, value_parser = valid_serial)]
    pub serial: String,
    /// Encrypted device node to read frames from
    #[clap(short, long, default_value = "/dev/eeg/encrypted")]
    pub device_path: PathBuf,
    /// Headset is a research edition (uses a different key layout)
    #[clap(short, long)]
    pub research: bool,
    /// Packet queue capacity, oldest packets are dropped when full (0 for unbounded)
    #[clap(short, long, default_value_t = 0)]
    pub capacity: usize,
    /// How long to wait for a frame before reporting a stall, in milliseconds
    #[clap(long, default_value_t = 100)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_ms: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn key_schedule(&self) -> KeySchedule {
        if self.research {
            KeySchedule::Research
        } else {
            KeySchedule::Consumer
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            poll_timeout: Duration::from_millis(self.poll_ms),
            queue_mode: match self.capacity {
                0 => QueueMode::Unbounded,
                n => QueueMode::DropOldest(n),
            },
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_serial(s: &str) -> Result<String, String> {
    KeySchedule::Consumer
        .derive(s)
        .map(|_| s.to_owned())
        .map_err(|e| e.to_string())
}
