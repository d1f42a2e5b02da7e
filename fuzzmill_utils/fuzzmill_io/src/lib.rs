use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

pub mod thread;

/// Handle to a pipe that is being drained on a background thread.
///
/// The reader thread appends everything it sees to a shared buffer; the
/// handle hands the accumulated bytes out on demand. Dropping the handle does
/// not stop the reader, the reader exits when the pipe hits EOF.
#[derive(Debug)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    fn new(buf: Arc<Mutex<Vec<u8>>>, finished: Arc<AtomicBool>) -> Self {
        Self { buf, finished }
    }

    /// Take everything read so far, leaving the buffer empty.
    pub fn current_data(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.split_off(0)
    }

    pub fn clear_current(&self) {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Wait until the pipe is closed, then return all remaining data.
    pub fn wait_finish(self) -> Vec<u8> {
        while !self.finished.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.current_data()
    }

    /// Like `wait_finish`, but gives up after `timeout` and returns whatever
    /// has arrived by then.
    pub fn wait_finish_timeout(self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while !self.finished.load(Ordering::Relaxed) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.current_data()
    }
}

impl Clone for BackgroundIoHandle {
    fn clone(&self) -> Self {
        BackgroundIoHandle {
            buf: Arc::clone(&self.buf),
            finished: Arc::clone(&self.finished),
        }
    }
}
