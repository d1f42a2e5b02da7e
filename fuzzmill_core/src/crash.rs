//! Crash fingerprinting and issue formatting.
//!
//! A crash is identified by its failure site (`<file>.go:<line>`). The
//! fingerprint is the first 16 hex characters of a SHA-256 over that line
//! plus a trailing newline; it is embedded in the issue title so that the
//! tracker itself acts as the deduplication store.

use crate::util::sha256_short;

/// Body placeholder used when the crash was triggered by a seed corpus
/// entry (added via `f.Add`), for which the engine saves no input file.
/// Issues carrying this placeholder cannot be verified automatically.
pub const SEED_CORPUS_MESSAGE: &str =
    "crash triggered by a seed corpus entry (f.Add); no failing input was saved";

/// Trailing line marking issues and comments as machine generated.
pub const WATERMARK: &str =
    "_This issue was filed automatically by the fuzzmill continuous fuzzing daemon._";

/// Comment posted when an open crash no longer reproduces.
pub fn close_comment() -> String {
    format!(
        "Fuzz crash no longer reproducible, closing the issue.\n{}",
        WATERMARK
    )
}

/// First 16 hex characters of `SHA-256(failure_site + "\n")`.
pub fn fingerprint(failure_site: &str) -> String {
    let mut line = String::with_capacity(failure_site.len() + 1);
    line.push_str(failure_site);
    line.push('\n');
    sha256_short(line.as_bytes())
}

/// Full issue title; unique per crash signature.
pub fn issue_title(fingerprint: &str, package: &str, target: &str) -> String {
    format!(
        "[fuzz/{}] Fuzzing crash in {}/{}",
        fingerprint, package, target
    )
}

/// Title fragment shared by every crash issue of one target, used to find
/// open issues during verification.
pub fn verify_title(package: &str, target: &str) -> String {
    format!("Fuzzing crash in {}/{}", package, target)
}

/// Render the Markdown issue body. Round-trips through [`parse_report`].
pub fn format_report(error_logs: &str, failing_input: Option<&[u8]>) -> String {
    let testcase = match failing_input {
        Some(data) => String::from_utf8_lossy(data).into_owned(),
        None => SEED_CORPUS_MESSAGE.to_string(),
    };
    format!(
        "## Error logs\n~~~sh\n{}\n~~~\n\n## Failing testcase\n~~~sh\n{}\n~~~\n\n{}\n",
        error_logs.trim_end_matches('\n'),
        testcase,
        WATERMARK
    )
}

/// Content of the `## Failing testcase` section of an issue body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportInput {
    /// The crash came from a seed corpus entry; there is nothing to replay.
    SeedCorpus,
    /// Saved failing input, byte for byte.
    Input(Vec<u8>),
}

/// Extract the failing testcase from an issue body. `None` means the body
/// has no such section (most likely an unrelated issue with a similar
/// title).
pub fn parse_report(body: &str) -> Option<ReportInput> {
    let re = regex::Regex::new(r"(?s)## Failing testcase\n~~~sh\n(.*?)\n~~~").unwrap();
    let content = re.captures(body)?.get(1)?.as_str();
    if content == SEED_CORPUS_MESSAGE {
        Some(ReportInput::SeedCorpus)
    } else {
        Some(ReportInput::Input(content.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let fp = fingerprint("stringutils_test.go:17");
        assert_eq!(fp, "cfec419a119b189c");
        assert_eq!(fp, fingerprint("stringutils_test.go:17"));
    }

    #[test]
    fn title_encodes_fingerprint_and_target() {
        let fp = fingerprint("stringutils_test.go:17");
        assert_eq!(
            issue_title(&fp, "stringutils", "FuzzReverseString"),
            "[fuzz/cfec419a119b189c] Fuzzing crash in stringutils/FuzzReverseString"
        );
        assert!(issue_title(&fp, "stringutils", "FuzzReverseString")
            .contains(&verify_title("stringutils", "FuzzReverseString")));
    }

    #[test]
    fn report_round_trips_input_bytes() {
        let input = b"go test fuzz v1\nstring(\"0\")\n";
        let body = format_report("some_test.go:17: boom\n", Some(input));
        match parse_report(&body) {
            Some(ReportInput::Input(data)) => assert_eq!(data, input),
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn report_round_trips_seed_corpus_sentinel() {
        let body = format_report("some_test.go:17: boom\n", None);
        assert_eq!(parse_report(&body), Some(ReportInput::SeedCorpus));
    }

    #[test]
    fn unrelated_body_has_no_testcase() {
        assert_eq!(parse_report("just some manually filed issue"), None);
    }

    #[test]
    fn body_carries_watermark_and_sections() {
        let body = format_report("logs\n", None);
        assert!(body.contains("## Error logs"));
        assert!(body.contains("## Failing testcase"));
        assert!(body.trim_end().ends_with(WATERMARK));
    }
}
