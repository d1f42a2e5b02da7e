use crate::BackgroundIoHandle;
use std::io::{BufRead, BufReader, Read};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Drain `r` line by line on a dedicated thread.
///
/// Lines are mirrored to `log::trace!` so that a stuck backend can be
/// diagnosed without holding the handle.
pub fn read_background<R: Read + Send + 'static>(r: R) -> BackgroundIoHandle {
    let buf = Arc::new(Mutex::new(Vec::with_capacity(4096)));
    let finished = Arc::new(AtomicBool::new(false));
    let buf1 = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);

    std::thread::spawn(move || {
        let mut line = String::with_capacity(4096);
        let mut reader = BufReader::new(r);
        while let Ok(sz) = reader.read_line(&mut line) {
            if sz == 0 {
                break;
            }
            let mut shared_buf = buf1.lock().unwrap();
            shared_buf.extend(line[..sz].as_bytes());
            log::trace!("background io: {}", line[..sz].trim_end());
            line.clear();
        }
        finished1.store(true, Ordering::Relaxed);
    });

    BackgroundIoHandle::new(buf, finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_until_eof() {
        let data = b"first line\nsecond line\n".to_vec();
        let handle = read_background(std::io::Cursor::new(data.clone()));
        let got = handle.wait_finish();
        assert_eq!(got, data);
    }

    #[test]
    fn current_data_drains_buffer() {
        let handle = read_background(std::io::Cursor::new(b"abc\n".to_vec()));
        let watcher = handle.clone();
        let got = handle.wait_finish();
        assert_eq!(got, b"abc\n");
        // the buffer was drained by wait_finish
        assert!(watcher.current_data().is_empty());
    }
}
