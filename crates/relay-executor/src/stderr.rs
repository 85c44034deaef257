//! Classification of agent diagnostic output.

use serde_json::Value;

/// What to do with one stderr line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrClass {
    /// Debug output: log it, forward only when debug forwarding is on.
    Debug(String),
    /// A failure the client should see.
    Error(String),
    /// Known noise or a stack-frame continuation.
    Suppressed,
}

/// Sorts agent stderr into debug output, real errors and noise.
#[derive(Debug, Clone)]
pub struct StderrFilter {
    /// Prefix marking debug lines.
    pub debug_marker: String,
    /// Substrings of warnings that are never surfaced.
    pub benign: Vec<String>,
    /// Whether debug lines are forwarded to the client.
    pub forward_debug: bool,
}

impl Default for StderrFilter {
    fn default() -> Self {
        Self {
            debug_marker: "[DEBUG]".to_owned(),
            benign: [
                "ExperimentalWarning",
                "DeprecationWarning",
                "--trace-warnings",
                "--trace-deprecation",
            ]
            .map(String::from)
            .to_vec(),
            forward_debug: false,
        }
    }
}

/// Source-excerpt lines allowed between a crash location and its caret.
const MAX_EXCERPT_LINES: usize = 2;

impl StderrFilter {
    /// Start classifying one agent's stderr stream.
    #[must_use]
    pub const fn stream(&self) -> StderrStream<'_> {
        StderrStream {
            filter: self,
            excerpt: None,
        }
    }

    /// Classify one line on its own.
    #[must_use]
    pub fn classify(&self, line: &str) -> StderrClass {
        let line = line.trim();
        if line.is_empty() {
            return StderrClass::Suppressed;
        }
        if !self.debug_marker.is_empty() && line.starts_with(&self.debug_marker) {
            return StderrClass::Debug(line.to_owned());
        }
        if let Some(error) = structured_error(line) {
            return StderrClass::Error(error);
        }
        if self.benign.iter().any(|b| line.contains(b.as_str())) {
            return StderrClass::Suppressed;
        }
        if is_stack_frame(line) {
            return StderrClass::Suppressed;
        }
        StderrClass::Error(strip_stack_suffix(line).to_owned())
    }
}

/// Stateful classifier for a single stderr stream.
///
/// Node prints an uncaught exception as a source location, the offending
/// source line and a `^` caret before the error itself. Those banner lines
/// are suppressed so the crash surfaces as a single error.
#[derive(Debug)]
pub struct StderrStream<'a> {
    filter: &'a StderrFilter,
    /// Excerpt lines seen since a crash location, while inside a banner.
    excerpt: Option<usize>,
}

impl StderrStream<'_> {
    /// Classify the next line of the stream.
    pub fn classify(&mut self, line: &str) -> StderrClass {
        let trimmed = line.trim();
        if let Some(seen) = self.excerpt {
            if is_caret(trimmed) {
                self.excerpt = None;
                return StderrClass::Suppressed;
            }
            if seen < MAX_EXCERPT_LINES {
                self.excerpt = Some(seen + 1);
                return StderrClass::Suppressed;
            }
            // No caret followed: not a banner after all.
            self.excerpt = None;
        }
        if is_source_location(trimmed) {
            self.excerpt = Some(0);
            return StderrClass::Suppressed;
        }
        self.filter.classify(line)
    }
}

/// `{"type":"error","error":...}` lines carry their own message.
fn structured_error(line: &str) -> Option<String> {
    if !line.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type")?.as_str()? != "error" {
        return None;
    }
    let message = match value.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| Value::Object(obj.clone()).to_string(), str::to_owned),
        _ => value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(line)
            .to_owned(),
    };
    Some(message)
}

fn is_stack_frame(line: &str) -> bool {
    line.starts_with("at ") || line == "^" || line.starts_with("Node.js v")
}

fn is_caret(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c == '^')
}

/// `/app/cli.js:123` or `node:internal/modules/cjs/loader:1080`.
fn is_source_location(line: &str) -> bool {
    let Some((file, number)) = line.rsplit_once(':') else {
        return false;
    };
    !number.is_empty()
        && number.bytes().all(|b| b.is_ascii_digit())
        && !file.is_empty()
        && !file.contains(char::is_whitespace)
        && (file.contains('/') || file.contains('.'))
}

fn strip_stack_suffix(line: &str) -> &str {
    line.find("    at ")
        .map_or(line, |idx| &line[..idx])
        .trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> StderrFilter {
        StderrFilter::default()
    }

    #[test]
    fn test_debug_marker() {
        assert_eq!(
            filter().classify("[DEBUG] loading tools"),
            StderrClass::Debug("[DEBUG] loading tools".into())
        );
    }

    #[test]
    fn test_structured_error() {
        assert_eq!(
            filter().classify(r#"{"type":"error","error":"rate limited"}"#),
            StderrClass::Error("rate limited".into())
        );
        assert_eq!(
            filter().classify(r#"{"type":"error","error":{"type":"overloaded","message":"try later"}}"#),
            StderrClass::Error("try later".into())
        );
        // JSON without an error type is just an unexpected line.
        assert_eq!(
            filter().classify(r#"{"type":"log"}"#),
            StderrClass::Error(r#"{"type":"log"}"#.into())
        );
    }

    #[test]
    fn test_benign_warnings_suppressed() {
        assert_eq!(
            filter().classify(
                "(node:42) ExperimentalWarning: The Fetch API is an experimental feature."
            ),
            StderrClass::Suppressed
        );
        assert_eq!(
            filter().classify("(Use `node --trace-warnings ...` to show where the warning was created)"),
            StderrClass::Suppressed
        );
    }

    #[test]
    fn test_stack_trace_stripped() {
        let f = filter();
        assert_eq!(
            f.classify("Error: ENOENT: no such file    at Object.open (node:fs:1:1)"),
            StderrClass::Error("Error: ENOENT: no such file".into())
        );
        assert_eq!(f.classify("    at Module._compile (node:internal/x:1:1)"), StderrClass::Suppressed);
        assert_eq!(f.classify("Node.js v20.11.0"), StderrClass::Suppressed);
    }

    #[test]
    fn test_node_crash_banner_is_one_error() {
        let f = filter();
        let mut stream = f.stream();
        let classes: Vec<_> = [
            "/usr/lib/node_modules/agent/cli.js:123",
            "        throw err;",
            "        ^",
            "Error: boom",
            "    at Object.<anonymous> (/usr/lib/node_modules/agent/cli.js:123:9)",
            "    at Module._compile (node:internal/modules/cjs/loader:1256:14)",
            "Node.js v20.11.0",
        ]
        .iter()
        .map(|line| stream.classify(line))
        .filter(|class| *class != StderrClass::Suppressed)
        .collect();
        assert_eq!(classes, vec![StderrClass::Error("Error: boom".into())]);
    }

    #[test]
    fn test_location_without_caret_resumes_classification() {
        let f = filter();
        let mut stream = f.stream();
        assert_eq!(stream.classify("node:internal/process/esm_loader:40"), StderrClass::Suppressed);
        assert_eq!(stream.classify("a"), StderrClass::Suppressed);
        assert_eq!(stream.classify("b"), StderrClass::Suppressed);
        assert_eq!(stream.classify("disk full"), StderrClass::Error("disk full".into()));
        // Plain messages ending in a number are not locations.
        assert_eq!(
            stream.classify("retrying in 30"),
            StderrClass::Error("retrying in 30".into())
        );
    }

    #[test]
    fn test_blank_and_custom_marker() {
        let f = StderrFilter {
            debug_marker: "DBG:".into(),
            ..StderrFilter::default()
        };
        assert_eq!(f.classify("   "), StderrClass::Suppressed);
        assert_eq!(f.classify("DBG: x"), StderrClass::Debug("DBG: x".into()));
        assert_eq!(
            f.classify("[DEBUG] x"),
            StderrClass::Error("[DEBUG] x".into())
        );
    }
}
