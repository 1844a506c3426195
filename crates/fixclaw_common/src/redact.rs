//! Evidence redaction rules.
//!
//! Removes secrets from command output before it is persisted as evidence.
//! Attempt directories are meant to be read by operators and handed to the
//! AI remediation tool, so credentials must never land there verbatim.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

const KEY_MARKER: &str = "[REDACTED: private key]";

static KEY_BEGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----").expect("static regex"));
static KEY_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-----END [A-Z ]*PRIVATE KEY-----").expect("static regex"));

/// Patterns that should be redacted, applied in order
static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // Private key blocks (single-line form, e.g. JSON-escaped)
        (
            Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----")
                .expect("static regex"),
            KEY_MARKER,
        ),
        // key=value / key: value style
        (
            Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password)\b(\s*[:=]\s*)([^\s"'`]+)"#)
                .expect("static regex"),
            "${1}${2}***",
        ),
        // Authorization: Bearer <token>
        (
            Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._\-]+").expect("static regex"),
            "${1} ***",
        ),
        // OpenAI / Anthropic style secret keys
        (
            Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}\b").expect("static regex"),
            "sk-***",
        ),
        // AWS access keys
        (
            Regex::new(r"AKIA[0-9A-Z]{16}").expect("static regex"),
            "[REDACTED: AWS access key]",
        ),
        // Database connection strings with passwords
        (
            Regex::new(r"(?i)\b(mysql|postgres|postgresql|mongodb|redis)://[^:\s]+:[^@\s]+@")
                .expect("static regex"),
            "${1}://[REDACTED]@",
        ),
    ]
});

/// Redact sensitive patterns from text
pub fn redact(text: &str) -> String {
    let mut result = Cow::Borrowed(text);

    for (pattern, replacement) in REDACTION_PATTERNS.iter() {
        if pattern.is_match(&result) {
            result = Cow::Owned(pattern.replace_all(&result, *replacement).into_owned());
        }
    }

    result.into_owned()
}

/// Line-oriented redactor for streamed output.
///
/// Feed lines (or segments of an overlong line) in order. A private key that
/// spans several lines is swallowed from its BEGIN line through its END line
/// and replaced by a single marker.
#[derive(Debug, Default)]
pub struct StreamRedactor {
    in_key: bool,
}

impl StreamRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redact_line(&mut self, line: &str) -> String {
        if self.in_key {
            return match KEY_END.find(line) {
                Some(end) => {
                    self.in_key = false;
                    self.redact_line(&line[end.end()..])
                }
                None => String::new(),
            };
        }

        // A BEGIN with no END after it opens a block
        match KEY_BEGIN.find_iter(line).last() {
            Some(begin) if !KEY_END.is_match(&line[begin.end()..]) => {
                self.in_key = true;
                let mut out = redact(&line[..begin.start()]);
                out.push_str(KEY_MARKER);
                out
            }
            _ => redact(line),
        }
    }

    /// Whether an unterminated key block is still being swallowed
    pub fn in_key(&self) -> bool {
        self.in_key
    }
}
