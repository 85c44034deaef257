//! Splitting raw output chunks into lines.

/// Accumulates output chunks and yields complete lines.
///
/// Chunks may end anywhere, including inside a multi-byte character; bytes are
/// held until their line is terminated. Blank lines are dropped and a trailing
/// `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Create an empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|&b| b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Take whatever unterminated output is left, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(br#"{"type":"assis"#).is_empty());
        assert_eq!(
            splitter.push(b"tant\"}\n{\"type\":\"res"),
            vec![r#"{"type":"assistant"}"#]
        );
        assert_eq!(splitter.push(b"ult\"}\n"), vec![r#"{"type":"result"}"#]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_several_lines_in_one_chunk() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\r\n\nb\n  \nc\n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_only_one_carriage_return_is_stripped() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"50%\r\r\n"), vec!["50%\r"]);
    }

    #[test]
    fn test_unterminated_tail_is_flushed() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"one\ntwo"), vec!["one"]);
        assert_eq!(splitter.finish().as_deref(), Some("two"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "héllo\n".as_bytes();
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&text[..2]).is_empty());
        assert_eq!(splitter.push(&text[2..]), vec!["héllo"]);
    }
}
