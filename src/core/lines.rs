//! Output tokenizing - line splitting, escape stripping, env parsing

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// CSI / OSC sequences and lone escapes emitted by colorful tools
fn escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("escape pattern is valid")
    })
}

/// Remove terminal control sequences and stray control characters
pub fn strip_ansi(line: &str) -> String {
    escape_re()
        .replace_all(line, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}

/// Width of `line` once escape sequences are removed
pub fn visible_width(line: &str) -> usize {
    escape_re().replace_all(line, "").chars().count()
}

/// Find the next token in `data`.
///
/// A token ends at the first `\n`, else at the first `\r`, found within
/// `max_len` bytes; without either, data longer than `max_len` is
/// force-split there. At EOF the rest is one token. Returns
/// `(consumed, token_len)`, or `None` when more input is needed.
pub fn next_token(data: &[u8], at_eof: bool, max_len: usize) -> Option<(usize, usize)> {
    if data.is_empty() {
        return None;
    }
    let max_len = max_len.max(1);
    let window = &data[..data.len().min(max_len + 1)];
    if let Some(i) = window.iter().position(|b| *b == b'\n') {
        return Some((i + 1, i));
    }
    if let Some(i) = window.iter().position(|b| *b == b'\r') {
        return Some((i + 1, i));
    }
    if data.len() > max_len {
        return Some((max_len, max_len));
    }
    if at_eof {
        return Some((data.len(), data.len()));
    }
    None
}

/// Incremental splitter fed with raw pipe reads
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max_len: usize,
}

impl LineSplitter {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Append a chunk and drain every complete token as a clean line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Flush whatever is left once the pipe closed
    pub fn finish(&mut self) -> Vec<String> {
        self.drain(true)
    }

    fn drain(&mut self, at_eof: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut offset = 0;
        while let Some((consumed, len)) = next_token(&self.buf[offset..], at_eof, self.max_len) {
            let token = &self.buf[offset..offset + len];
            lines.push(strip_ansi(&String::from_utf8_lossy(token)));
            offset += consumed;
        }
        self.buf.drain(..offset);
        lines
    }
}

/// Parse `env` output into a map; a line without `=` maps to an empty value
pub fn parse_env(data: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => env.insert(key.to_string(), value.to_string()),
            None => env.insert(line.to_string(), String::new()),
        };
    }
    env
}
