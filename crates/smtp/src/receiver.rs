/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

/// The per-line cap, for command lines and body lines alike.
pub const MAX_LINE_LENGTH: usize = 32 * 1024;

pub enum LineResult {
    /// A complete line, without its CRLF.
    Line(Vec<u8>),
    NeedsMoreData,
    TooLong,
}

/// Accumulates one command line across reads.
#[derive(Default)]
pub struct LineReceiver {
    buf: Vec<u8>,
}

impl LineReceiver {
    pub fn new() -> LineReceiver {
        LineReceiver::default()
    }

    pub fn ingest(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> LineResult {
        for &ch in bytes {
            if ch == b'\n' {
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                return LineResult::Line(std::mem::take(&mut self.buf));
            }
            self.buf.push(ch);
            if self.buf.len() > MAX_LINE_LENGTH {
                self.buf.clear();
                return LineResult::TooLong;
            }
        }
        LineResult::NeedsMoreData
    }
}

pub enum DataResult {
    /// The terminating dot arrived; the body is complete.
    Done,
    NeedsMoreData,
    TooLong,
}

/// Accumulates the message body between DATA and the solitary dot,
/// undoing dot-stuffing: a line of just "." terminates, and a leading
/// "." on any other line is stripped.
#[derive(Default)]
pub struct DataReceiver {
    line: Vec<u8>,
    pub body: Vec<u8>,
}

impl DataReceiver {
    pub fn new() -> DataReceiver {
        DataReceiver::default()
    }

    pub fn ingest(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> DataResult {
        for &ch in bytes {
            if ch != b'\n' {
                self.line.push(ch);
                if self.line.len() > MAX_LINE_LENGTH {
                    return DataResult::TooLong;
                }
                continue;
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            if self.line == b"." {
                self.line.clear();
                return DataResult::Done;
            }
            let stuffed = self.line.first() == Some(&b'.');
            self.body
                .extend_from_slice(&self.line[if stuffed { 1 } else { 0 }..]);
            self.body.extend_from_slice(b"\r\n");
            self.line.clear();
        }
        DataResult::NeedsMoreData
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(receiver: &mut DataReceiver, input: &[u8]) -> bool {
        let mut iter = input.iter();
        matches!(receiver.ingest(&mut iter), DataResult::Done)
    }

    #[test]
    fn line_receiver_strips_crlf() {
        let mut receiver = LineReceiver::new();
        let mut iter = b"EHLO x\r\nMAIL".iter();
        match receiver.ingest(&mut iter) {
            LineResult::Line(line) => assert_eq!(line, b"EHLO x"),
            _ => panic!("expected a line"),
        }
        assert!(matches!(receiver.ingest(&mut iter), LineResult::NeedsMoreData));
        let mut iter = b" FROM:<a@b>\r\n".iter();
        match receiver.ingest(&mut iter) {
            LineResult::Line(line) => assert_eq!(line, b"MAIL FROM:<a@b>"),
            _ => panic!("expected a line"),
        }
    }

    #[test]
    fn dot_terminates() {
        let mut receiver = DataReceiver::new();
        assert!(feed_lines(&mut receiver, b"Subject: t\r\n\r\nhi\r\n.\r\n"));
        assert_eq!(receiver.body, b"Subject: t\r\n\r\nhi\r\n");
    }

    #[test]
    fn dot_unstuffing() {
        let mut receiver = DataReceiver::new();
        assert!(feed_lines(
            &mut receiver,
            b"..leading dot\r\n.also stuffed\r\nplain\r\n.\r\n"
        ));
        assert_eq!(receiver.body, b".leading dot\r\nalso stuffed\r\nplain\r\n");
    }

    #[test]
    fn dot_needs_its_own_line() {
        let mut receiver = DataReceiver::new();
        assert!(!feed_lines(&mut receiver, b"not.\r\na.b\r\n"));
        assert!(feed_lines(&mut receiver, b".\r\n"));
        assert_eq!(receiver.body, b"not.\r\na.b\r\n");
    }

    #[test]
    fn body_split_across_reads() {
        let mut receiver = DataReceiver::new();
        assert!(!feed_lines(&mut receiver, b"he"));
        assert!(!feed_lines(&mut receiver, b"llo\r\n."));
        assert!(feed_lines(&mut receiver, b"\r\n"));
        assert_eq!(receiver.body, b"hello\r\n");
    }

    #[test]
    fn overlong_line_reported() {
        let mut receiver = LineReceiver::new();
        let long = vec![b'x'; MAX_LINE_LENGTH + 1];
        let mut iter = long.iter();
        assert!(matches!(receiver.ingest(&mut iter), LineResult::TooLong));
    }
}
