//! Streaming parser for the output of one fuzz run.
//!
//! The combined stdout/stderr of a sandboxed `go test -fuzz` run is consumed
//! line by line. Before a failure marker is seen, lines are only logged.
//! Once a `--- FAIL:` line shows up every following line belongs to the
//! crash: the first `<file>.go:<line>` occurrence becomes the failure site
//! (the deduplication key) and the first "Failing input written to ..." line
//! names the on-disk input that triggered the crash.

use regex::Regex;
use std::fs;
use std::io::{self, BufRead};
use std::path::PathBuf;

/// A crash captured from a fuzz run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzCrash {
    /// Everything printed after the failure marker.
    pub error_logs: String,
    /// Bytes of the failing input, when the engine persisted one and the
    /// file could be read. Crashes on seed corpus entries have none.
    pub failing_input: Option<Vec<u8>>,
    /// First `<file>.go:<line>` seen in the failure section; may be empty
    /// when the output held no such line.
    pub failure_site: String,
}

const FAIL_MARKER: &str = "--- FAIL:";

pub struct OutputProcessor {
    /// `<pkg>/testdata/fuzz` inside the project tree, where the engine
    /// writes failing inputs.
    testdata_dir: PathBuf,
    site_re: Regex,
    input_re: Regex,
}

impl OutputProcessor {
    pub fn new<P: Into<PathBuf>>(testdata_dir: P) -> Self {
        Self {
            testdata_dir: testdata_dir.into(),
            // Matches stack-trace and t.Errorf lines such as
            //   "    stringutils_test.go:17: Reverse produced invalid ..."
            site_re: Regex::new(r"\s*(?P<file>.*\.go):(?P<line>[0-9]+)").unwrap(),
            // Matches
            //   "Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983"
            input_re: Regex::new(
                r"Failing input written to testdata/fuzz/(?P<target>[^/]+)/(?P<id>[0-9a-f]+)",
            )
            .unwrap(),
        }
    }

    /// Consume the stream to EOF. Returns a crash if a failure marker was
    /// seen, `None` otherwise. The stream is not closed; the caller owns it.
    pub fn process<R: BufRead>(&self, stream: &mut R) -> io::Result<Option<FuzzCrash>> {
        if !self.scan_until_failure(stream)? {
            return Ok(None);
        }
        self.collect_failure(stream).map(Some)
    }

    fn scan_until_failure<R: BufRead>(&self, stream: &mut R) -> io::Result<bool> {
        let mut raw = Vec::with_capacity(256);
        loop {
            raw.clear();
            if stream.read_until(b'\n', &mut raw)? == 0 {
                return Ok(false);
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            log::debug!("fuzz output: {}", line);
            if line.contains(FAIL_MARKER) {
                return Ok(true);
            }
        }
    }

    fn collect_failure<R: BufRead>(&self, stream: &mut R) -> io::Result<FuzzCrash> {
        let mut error_logs = String::new();
        let mut failure_site = String::new();
        let mut failing_input = None;

        let mut raw = Vec::with_capacity(256);
        loop {
            raw.clear();
            if stream.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            log::debug!("fuzz output: {}", line);

            error_logs.push_str(line);
            error_logs.push('\n');

            if failure_site.is_empty() {
                if let Some(site) = self.parse_site(line) {
                    failure_site = site;
                }
            }

            if failing_input.is_some() {
                continue;
            }
            // Crashes on seed corpus entries (added via f.Add) print
            //   "failure while testing seed corpus entry: FuzzFoo/seed#0"
            // and never name an input file, so nothing matches here.
            if let Some((target, id)) = self.parse_failing_input(line) {
                failing_input = self.read_failing_input(&target, &id);
            }
        }

        Ok(FuzzCrash {
            error_logs,
            failing_input,
            failure_site,
        })
    }

    /// Extract `<file>.go:<line>` from a failure line, if present.
    pub fn parse_site(&self, line: &str) -> Option<String> {
        let caps = self.site_re.captures(line)?;
        Some(format!("{}:{}", &caps["file"], &caps["line"]))
    }

    /// Extract the `(target, input id)` pair from a failing-input line.
    pub fn parse_failing_input(&self, line: &str) -> Option<(String, String)> {
        let caps = self.input_re.captures(line)?;
        Some((caps["target"].to_string(), caps["id"].to_string()))
    }

    /// A missing file is not an error: the crash is still reported, only
    /// without a reproducer.
    fn read_failing_input(&self, target: &str, id: &str) -> Option<Vec<u8>> {
        let path = self.testdata_dir.join(target).join(id);
        match fs::read(&path) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("failed to read failing input {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_site_variants() {
        let p = OutputProcessor::new("testdata");
        assert_eq!(p.parse_site("--- FAIL: FuzzParseComplex (0.00s)"), None);
        assert_eq!(
            p.parse_site("      stringutils_test.go:17: Reverse produced invalid UTF-8 string"),
            Some("stringutils_test.go:17".to_string())
        );
        assert_eq!(
            p.parse_site("go@1.23/1.23.9/libexec/src/testing/fuzz.go:322 +0x49c"),
            Some("go@1.23/1.23.9/libexec/src/testing/fuzz.go:322".to_string())
        );
    }

    #[test]
    fn parse_failing_input_variants() {
        let p = OutputProcessor::new("testdata");
        assert_eq!(
            p.parse_failing_input(
                "Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983"
            ),
            Some(("FuzzFoo".to_string(), "771e938e4458e983".to_string()))
        );
        assert_eq!(
            p.parse_failing_input("failure while testing seed corpus entry: FuzzFoo/seed#0"),
            None
        );
        assert_eq!(
            p.parse_failing_input("elapsed: 0s, gathering baseline coverage:"),
            None
        );
    }

    #[test]
    fn clean_stream_yields_no_crash() {
        let p = OutputProcessor::new("testdata");
        let mut stream = Cursor::new(
            "fuzz: elapsed: 0s, gathering baseline coverage: 0/3 completed\n\
             fuzz: elapsed: 3s, execs: 1234 (411/sec)\n\
             PASS\n",
        );
        assert_eq!(p.process(&mut stream).unwrap(), None);
    }

    #[test]
    fn crash_with_persisted_input_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("FuzzFoo");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(
            target_dir.join("771e938e4458e983"),
            b"go test fuzz v1\nstring(\"0\")\n",
        )
        .unwrap();

        let p = OutputProcessor::new(dir.path());
        let mut stream = Cursor::new(
            "fuzz: elapsed: 1s, execs: 90 (89/sec)\n\
             --- FAIL: FuzzFoo (1.04s)\n\
                 stringutils_test.go:17: Reverse produced invalid UTF-8 string\n\
             \n\
                 Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983\n\
                 To re-run:\n\
                 go test -run=FuzzFoo/771e938e4458e983\n\
             FAIL\n",
        );
        let crash = p.process(&mut stream).unwrap().unwrap();
        assert_eq!(crash.failure_site, "stringutils_test.go:17");
        assert_eq!(
            crash.failing_input.as_deref(),
            Some(&b"go test fuzz v1\nstring(\"0\")\n"[..])
        );
        assert!(crash
            .error_logs
            .contains("Reverse produced invalid UTF-8 string"));
        // lines before the marker are not part of the error logs
        assert!(!crash.error_logs.contains("89/sec"));
    }

    #[test]
    fn missing_input_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = OutputProcessor::new(dir.path());
        let mut stream = Cursor::new(
            "--- FAIL: FuzzFoo (0.01s)\n\
                 Failing input written to testdata/fuzz/FuzzFoo/deadbeef00112233\n",
        );
        let crash = p.process(&mut stream).unwrap().unwrap();
        assert_eq!(crash.failing_input, None);
    }

    #[test]
    fn seed_corpus_crash_has_no_input() {
        let p = OutputProcessor::new("testdata");
        let mut stream = Cursor::new(
            "--- FAIL: FuzzFoo (0.00s)\n\
                 failure while testing seed corpus entry: FuzzFoo/seed#0\n\
                 stringutils_test.go:17: boom\n",
        );
        let crash = p.process(&mut stream).unwrap().unwrap();
        assert_eq!(crash.failing_input, None);
        assert_eq!(crash.failure_site, "stringutils_test.go:17");
    }
}
