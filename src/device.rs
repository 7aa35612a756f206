//! Device access
//!
//! The headset shows up as a character device that hands out 32 byte frames.
//! There are no sync markers, so once we lose a frame boundary there's no
//! getting it back; any short read ends the session.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    RawFrame, DEFAULT_DEVICE_PATH, DEFAULT_READ_TIMEOUT, FRAME_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing became readable before the timeout
    NoData,
    Frame(RawFrame),
}

/// Anything the capture loop can pull frames from
pub trait FrameSource: Send + 'static {
    fn open(&mut self) -> Result<()>;

    /// Wait up to `timeout` for a frame
    fn read_frame(&mut self, timeout: Duration) -> Result<ReadOutcome>;

    /// Release the underlying handle. Calling this when nothing is open is a
    /// no-op.
    fn close(&mut self);

    fn describe(&self) -> String {
        "frame source".to_owned()
    }
}

pub struct DeviceChannel {
    path: PathBuf,
    read_timeout: Duration,
    file: Option<File>,
}

impl Default for DeviceChannel {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_PATH)
    }
}

impl DeviceChannel {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            file: None,
        }
    }

    /// Limit on how long the rest of a frame may take once its first bytes
    /// have arrived
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl FrameSource for DeviceChannel {
    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = File::open(&self.path).map_err(|source| Error::Open {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = ?self.path, "Opened device");
        self.file = Some(file);
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        let file = self.file.as_mut().ok_or(Error::NotOpen)?;
        if !wait_readable(file, timeout)? {
            return Ok(ReadOutcome::NoData);
        }
        let mut frame = RawFrame::new([0u8; FRAME_SIZE]);
        let mut filled = 0;
        while filled < FRAME_SIZE {
            if filled > 0 && !wait_readable(file, self.read_timeout)? {
                return Err(Error::ShortRead {
                    expected: FRAME_SIZE,
                    got: filled,
                });
            }
            match file.read(&mut frame.bytes[filled..]) {
                Ok(0) => {
                    return Err(Error::ShortRead {
                        expected: FRAME_SIZE,
                        got: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ReadOutcome::Frame(frame))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = ?self.path, "Closed device");
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// poll(2) the file for readability. A hangup or error also counts as
/// readable; the following read reports what actually happened. Signals
/// landing mid-wait don't shorten it: the poll is retried until `timeout` has
/// passed since entry.
fn wait_readable(file: &File, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // Round up so sub-millisecond timeouts still wait
        let millis = ((remaining.as_micros() + 999) / 1000).min(libc::c_int::MAX as u128)
            as libc::c_int;
        // Safety: we pass exactly one valid pollfd, and `file` keeps the
        // descriptor open for the duration of the call
        let ret = unsafe { libc::poll(&mut fds, 1, millis) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::{
        ffi::CString,
        fs::{self, OpenOptions},
        io::Write,
        os::unix::ffi::OsStrExt,
        thread,
    };

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("eeg_slurper-{}-{}", std::process::id(), name))
    }

    fn mkfifo(path: &Path) {
        let _ = fs::remove_file(path);
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    }

    fn expect_frame(outcome: ReadOutcome) -> RawFrame {
        match outcome {
            ReadOutcome::Frame(f) => f,
            ReadOutcome::NoData => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_open_missing_device() {
        let mut dev = DeviceChannel::new("/nonexistent/eeg/encrypted");
        assert_eq!(dev.path(), Path::new("/nonexistent/eeg/encrypted"));
        match dev.open() {
            Err(Error::Open { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/eeg/encrypted"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dev.is_open());
        // Never opened, still fine to close
        dev.close();
        dev.close();
    }

    #[test]
    fn test_read_before_open() {
        let mut dev = DeviceChannel::new(temp_path("unopened"));
        assert!(matches!(
            dev.read_frame(Duration::from_millis(1)),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn test_frames_then_short_read() {
        let path = temp_path("frames");
        let mut contents = vec![0xa5u8; FRAME_SIZE];
        contents.extend_from_slice(&[0x5a; FRAME_SIZE]);
        contents.extend_from_slice(&[1, 2, 3, 4, 5]);
        fs::write(&path, &contents).unwrap();

        let mut dev = DeviceChannel::new(&path);
        dev.open().unwrap();
        let timeout = Duration::from_millis(100);
        let first = expect_frame(dev.read_frame(timeout).unwrap());
        let second = expect_frame(dev.read_frame(timeout).unwrap());
        assert_eq!(first.bytes, [0xa5; FRAME_SIZE]);
        assert_eq!(second.bytes, [0x5a; FRAME_SIZE]);
        assert!(second.received >= first.received);
        assert!(matches!(
            dev.read_frame(timeout),
            Err(Error::ShortRead {
                expected: FRAME_SIZE,
                got: 5
            })
        ));
        dev.close();
        assert!(!dev.is_open());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_fifo_poll_and_eof() {
        let path = temp_path("fifo");
        mkfifo(&path);
        let (go_tx, go_rx) = unbounded::<()>();
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut w = OpenOptions::new().write(true).open(&writer_path).unwrap();
            go_rx.recv().unwrap();
            w.write_all(&[7u8; FRAME_SIZE]).unwrap();
            go_rx.recv().unwrap();
            w.write_all(&[9u8; 10]).unwrap();
        });

        let mut dev = DeviceChannel::new(&path);
        dev.open().unwrap();
        assert_eq!(
            dev.read_frame(Duration::from_millis(20)).unwrap(),
            ReadOutcome::NoData
        );
        go_tx.send(()).unwrap();
        let frame = expect_frame(dev.read_frame(Duration::from_secs(5)).unwrap());
        assert_eq!(frame.bytes, [7u8; FRAME_SIZE]);
        go_tx.send(()).unwrap();
        writer.join().unwrap();
        assert!(matches!(
            dev.read_frame(Duration::from_secs(5)),
            Err(Error::ShortRead { got: 10, .. })
        ));
        dev.close();
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_mid_frame_stall_times_out() {
        let path = temp_path("stall");
        mkfifo(&path);
        let (done_tx, done_rx) = unbounded::<()>();
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut w = OpenOptions::new().write(true).open(&writer_path).unwrap();
            w.write_all(&[1u8; 12]).unwrap();
            // Hold the write end open without finishing the frame
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
        });

        let mut dev = DeviceChannel::new(&path).with_read_timeout(Duration::from_millis(30));
        dev.open().unwrap();
        let start = std::time::Instant::now();
        assert!(matches!(
            dev.read_frame(Duration::from_secs(5)),
            Err(Error::ShortRead { got: 12, .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
        done_tx.send(()).unwrap();
        writer.join().unwrap();
        dev.close();
        fs::remove_file(&path).unwrap();
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn test_signal_mid_frame_is_not_a_short_read() {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = ignore_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(
                libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()),
                0
            );
        }

        let path = temp_path("signal");
        mkfifo(&path);
        let reader = unsafe { libc::pthread_self() };
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut w = OpenOptions::new().write(true).open(&writer_path).unwrap();
            w.write_all(&[1u8; 12]).unwrap();
            // Let the reader take the first chunk and start waiting for the rest
            thread::sleep(Duration::from_millis(50));
            assert_eq!(unsafe { libc::pthread_kill(reader, libc::SIGUSR1) }, 0);
            thread::sleep(Duration::from_millis(100));
            w.write_all(&[2u8; FRAME_SIZE - 12]).unwrap();
        });

        let mut dev = DeviceChannel::new(&path).with_read_timeout(Duration::from_millis(500));
        dev.open().unwrap();
        let frame = expect_frame(dev.read_frame(Duration::from_secs(5)).unwrap());
        assert_eq!(frame.bytes[..12], [1u8; 12]);
        assert_eq!(frame.bytes[12..], [2u8; FRAME_SIZE - 12]);
        writer.join().unwrap();
        dev.close();
        fs::remove_file(&path).unwrap();
    }
}
