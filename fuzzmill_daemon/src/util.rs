//! Daemon-local helpers: path expansion and the rotating log file writer.

use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Expand a leading `~` and `$VAR`/`${VAR}` references in `path`.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let mut s = raw.into_owned();

    if s == "~" || s.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            s = format!("{}{}", home.to_string_lossy(), &s[1..]);
        }
    }

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    let expanded = re.replace_all(&s, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        std::env::var(name).unwrap_or_default()
    });
    PathBuf::from(expanded.into_owned())
}

/// Append-only log file that rotates once it exceeds `max_size` bytes,
/// keeping at most `max_backups` older files (`<name>.1` is the newest
/// backup).
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_backups: usize,
}

impl RotatingFile {
    pub fn open(path: PathBuf, max_size: u64, max_backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_size,
            max_backups,
        })
    }

    fn backup_path(&self, i: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), i))
    }

    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(i + 1));
            }
        }
        if self.max_backups > 0 {
            let _ = fs::rename(&self.path, self.backup_path(1));
        }
        self.file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_env_vars() {
        std::env::set_var("FUZZMILL_TEST_DIR", "/data");
        assert_eq!(
            expand_path(Path::new("$FUZZMILL_TEST_DIR/ws")),
            PathBuf::from("/data/ws")
        );
        assert_eq!(
            expand_path(Path::new("${FUZZMILL_TEST_DIR}/ws")),
            PathBuf::from("/data/ws")
        );
        assert_eq!(expand_path(Path::new("/plain")), PathBuf::from("/plain"));
    }

    #[test]
    fn expands_home() {
        std::env::set_var("HOME", "/home/miller");
        assert_eq!(
            expand_path(Path::new("~/logs")),
            PathBuf::from("/home/miller/logs")
        );
    }

    #[test]
    fn rotates_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut file = RotatingFile::open(path.clone(), 16, 2).unwrap();

        file.write_all(b"0123456789").unwrap();
        file.write_all(b"0123456789").unwrap(); // exceeds 16 -> rotate first
        file.flush().unwrap();

        let backup = dir.path().join("daemon.log.1");
        assert_eq!(fs::read(&backup).unwrap(), b"0123456789");
        assert_eq!(fs::read(&path).unwrap(), b"0123456789");

        file.write_all(b"0123456789").unwrap(); // rotate again
        assert_eq!(fs::read(dir.path().join("daemon.log.2")).unwrap(), b"0123456789");
    }
}
