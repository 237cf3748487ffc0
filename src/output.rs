//! Bounded capture of a server's recent output.
//!
//! Servers write to their own log file through the redirection in their
//! command, so the capture is the tail of that file. It is only used to sniff
//! port announcements, which is why lines are stored ANSI-stripped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use strip_ansi_escapes::strip;

/// Lines kept from a freshly started server's log.
pub const DEFAULT_CAPTURE_LINES: usize = 200;
const MAX_TAIL_BYTES: u64 = 64 * 1024;

/// A fixed-capacity ring buffer of output lines.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl OutputCapture {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Reads the tail of `path`; a missing or unreadable file yields an empty capture.
    pub fn from_log_file(path: &Path, max_lines: usize) -> Self {
        let mut capture = Self::new(max_lines);
        if let Some(tail) = read_tail(path, MAX_TAIL_BYTES) {
            for line in tail.lines() {
                capture.push(sanitize_text(line));
            }
        }
        capture
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}

fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Removes ANSI escape codes; invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
